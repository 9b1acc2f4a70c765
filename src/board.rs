//! Board snapshots recovered from diagram markup.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Number of cells in every snapshot.
pub const BOARD_SQUARES: usize = 64;

const COLUMN_NAMES: [char; 8] = ['a', 'b', 'c', 'd', 'e', 'f', 'g', 'h'];
const ROW_NAMES: [char; 8] = ['1', '2', '3', '4', '5', '6', '7', '8'];

/// Side owning a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    /// White pieces (sprite column 0).
    White,
    /// Black pieces (any other sprite column).
    Black,
}

impl Color {
    /// Lowercase name used in corpus tokens.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::White => "white",
            Self::Black => "black",
        }
    }
}

/// Piece type. `Unknown` covers sprite rows outside the fixed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PieceKind {
    /// King.
    King,
    /// Queen.
    Queen,
    /// Rook.
    Rook,
    /// Knight.
    Knight,
    /// Bishop.
    Bishop,
    /// Pawn.
    Pawn,
    /// Sprite offset not present in the lookup table.
    Unknown,
}

impl PieceKind {
    /// Maps the sprite sheet's vertical offset (in pixels) to a piece type.
    pub fn from_sprite_top(top: i32) -> Self {
        match top {
            0 => Self::King,
            -30 => Self::Queen,
            -60 => Self::Rook,
            -90 => Self::Knight,
            -120 => Self::Bishop,
            -150 => Self::Pawn,
            _ => Self::Unknown,
        }
    }

    /// Lowercase name used in corpus tokens.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::King => "king",
            Self::Queen => "queen",
            Self::Rook => "rook",
            Self::Knight => "knight",
            Self::Bishop => "bishop",
            Self::Pawn => "pawn",
            Self::Unknown => "unknown",
        }
    }
}

/// A colored piece, serialized as `"<color>_<kind>"` (for example `white_pawn`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Piece {
    /// Owning side.
    pub color: Color,
    /// Piece type.
    pub kind: PieceKind,
}

impl Piece {
    /// Builds a piece.
    pub fn new(color: Color, kind: PieceKind) -> Self {
        Self { color, kind }
    }

    /// Decodes the sprite offsets carried by a diagram image.
    pub fn from_sprite_offset(left: i32, top: i32) -> Self {
        let color = if left == 0 { Color::White } else { Color::Black };
        Self::new(color, PieceKind::from_sprite_top(top))
    }
}

impl fmt::Display for Piece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.color.as_str(), self.kind.as_str())
    }
}

impl FromStr for Piece {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (color, kind) = value
            .split_once('_')
            .ok_or_else(|| format!("piece '{value}' is not <color>_<kind>"))?;
        let color = match color {
            "white" => Color::White,
            "black" => Color::Black,
            other => return Err(format!("unknown piece color '{other}'")),
        };
        let kind = match kind {
            "king" => PieceKind::King,
            "queen" => PieceKind::Queen,
            "rook" => PieceKind::Rook,
            "knight" => PieceKind::Knight,
            "bishop" => PieceKind::Bishop,
            "pawn" => PieceKind::Pawn,
            "unknown" => PieceKind::Unknown,
            other => return Err(format!("unknown piece kind '{other}'")),
        };
        Ok(Self::new(color, kind))
    }
}

impl Serialize for Piece {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Piece {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// One square of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardCell {
    /// Square name such as `e4`.
    pub location: String,
    /// Occupant, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub piece: Option<Piece>,
}

/// Exactly 64 cells in diagram order.
///
/// Cell `i` names square `columns[i / 8]` + `rows[i % 8]`, i.e. a1, a2, .., a8, b1, ...
/// That is the order in which the diagram markup lists its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<BoardCell>", into = "Vec<BoardCell>")]
pub struct BoardSnapshot {
    cells: Vec<BoardCell>,
}

impl BoardSnapshot {
    /// Square name for the `index`-th diagram child.
    pub fn square_name(index: usize) -> String {
        let column = COLUMN_NAMES[(index / ROW_NAMES.len()) % COLUMN_NAMES.len()];
        let row = ROW_NAMES[index % ROW_NAMES.len()];
        format!("{column}{row}")
    }

    /// Builds a snapshot by asking `occupant` for the piece on each cell index.
    pub fn from_fn<F>(mut occupant: F) -> Self
    where
        F: FnMut(usize) -> Option<Piece>,
    {
        let cells = (0..BOARD_SQUARES)
            .map(|index| BoardCell {
                location: Self::square_name(index),
                piece: occupant(index),
            })
            .collect();
        Self { cells }
    }

    /// A board with no pieces.
    pub fn empty() -> Self {
        Self::from_fn(|_| None)
    }

    /// Standard chess starting position.
    pub fn initial_position() -> Self {
        const BACK_RANK: [PieceKind; 8] = [
            PieceKind::Rook,
            PieceKind::Knight,
            PieceKind::Bishop,
            PieceKind::Queen,
            PieceKind::King,
            PieceKind::Bishop,
            PieceKind::Knight,
            PieceKind::Rook,
        ];
        Self::from_fn(|index| {
            let file = index / ROW_NAMES.len();
            match index % ROW_NAMES.len() {
                0 => Some(Piece::new(Color::White, BACK_RANK[file])),
                1 => Some(Piece::new(Color::White, PieceKind::Pawn)),
                6 => Some(Piece::new(Color::Black, PieceKind::Pawn)),
                7 => Some(Piece::new(Color::Black, BACK_RANK[file])),
                _ => None,
            }
        })
    }

    /// Cells in diagram order.
    pub fn cells(&self) -> &[BoardCell] {
        &self.cells
    }

    /// Looks up a cell by square name.
    pub fn cell(&self, location: &str) -> Option<&BoardCell> {
        self.cells.iter().find(|cell| cell.location == location)
    }

    /// Space-separated occupancy: the piece token or `eps` for each cell.
    pub fn occupancy(&self) -> String {
        let tokens: Vec<String> = self
            .cells
            .iter()
            .map(|cell| match &cell.piece {
                Some(piece) => piece.to_string(),
                None => "eps".to_string(),
            })
            .collect();
        tokens.join(" ")
    }
}

impl TryFrom<Vec<BoardCell>> for BoardSnapshot {
    type Error = String;

    fn try_from(cells: Vec<BoardCell>) -> Result<Self, Self::Error> {
        if cells.len() != BOARD_SQUARES {
            return Err(format!(
                "board snapshot needs {BOARD_SQUARES} cells, found {}",
                cells.len()
            ));
        }
        Ok(Self { cells })
    }
}

impl From<BoardSnapshot> for Vec<BoardCell> {
    fn from(snapshot: BoardSnapshot) -> Self {
        snapshot.cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_names_follow_diagram_order() {
        assert_eq!(BoardSnapshot::square_name(0), "a1");
        assert_eq!(BoardSnapshot::square_name(7), "a8");
        assert_eq!(BoardSnapshot::square_name(8), "b1");
        assert_eq!(BoardSnapshot::square_name(35), "e4");
        assert_eq!(BoardSnapshot::square_name(63), "h8");
    }

    #[test]
    fn sprite_offsets_decode_color_and_kind() {
        assert_eq!(
            Piece::from_sprite_offset(0, -150),
            Piece::new(Color::White, PieceKind::Pawn)
        );
        assert_eq!(
            Piece::from_sprite_offset(-30, 0),
            Piece::new(Color::Black, PieceKind::King)
        );
        assert_eq!(Piece::from_sprite_offset(0, -45).kind, PieceKind::Unknown);
    }

    #[test]
    fn initial_position_places_kings_on_e_file() {
        let board = BoardSnapshot::initial_position();
        assert_eq!(board.cells().len(), BOARD_SQUARES);
        assert_eq!(
            board.cell("e1").and_then(|cell| cell.piece),
            Some(Piece::new(Color::White, PieceKind::King))
        );
        assert_eq!(
            board.cell("d8").and_then(|cell| cell.piece),
            Some(Piece::new(Color::Black, PieceKind::Queen))
        );
        assert_eq!(board.cell("e4").and_then(|cell| cell.piece), None);
    }

    #[test]
    fn snapshot_json_uses_piece_strings_and_rejects_short_boards() {
        let board = BoardSnapshot::initial_position();
        let json = serde_json::to_value(&board).unwrap();
        assert_eq!(json[0]["location"], "a1");
        assert_eq!(json[0]["piece"], "white_rook");
        assert!(json[2].get("piece").is_none());

        let decoded: BoardSnapshot = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(decoded, board);

        let mut short = json.as_array().cloned().unwrap();
        short.pop();
        let err = serde_json::from_value::<BoardSnapshot>(serde_json::Value::Array(short));
        assert!(err.is_err());
    }
}
