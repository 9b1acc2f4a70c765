//! Move-list tokenization for corpus source lines.

use crate::board::Color;

/// Closes every ply in a source line.
pub const END_OF_MOVE: &str = "<EOM>";

/// Token for moves outside the handled shapes (castling, promotions, ...).
pub const STRANGE_MOVE: &str = "_<strangeMove>";

/// Piece name for a SAN piece letter; any other character is read as a pawn file.
pub fn piece_name(letter: char) -> String {
    match letter {
        'K' => "king".to_string(),
        'Q' => "queen".to_string(),
        'R' => "rook".to_string(),
        'B' => "bishop".to_string(),
        'N' => "knight".to_string(),
        file => format!("pawn {file}"),
    }
}

/// Tokenizes one SAN move.
///
/// Check and mate markers are dropped first. `e4` becomes `_pawn e4`,
/// `Nf3` becomes `_knight f3`, and captures such as `Bxc6` become
/// `_bishop X c6`. Anything else is [`STRANGE_MOVE`].
pub fn move_token(san: &str) -> String {
    let san = san.trim_end_matches(|c| c == '+' || c == '#');
    let mut chars = san.chars();
    let Some(first) = chars.next() else {
        return STRANGE_MOVE.to_string();
    };

    if san.contains('x') {
        let destination: String = san.chars().skip(2).collect();
        if destination.is_empty() {
            return STRANGE_MOVE.to_string();
        }
        return format!("_{} X {destination}", piece_name(first));
    }
    match san.chars().count() {
        2 => format!("_pawn {san}"),
        3 => format!("_{} {}", piece_name(first), chars.as_str()),
        _ => STRANGE_MOVE.to_string(),
    }
}

/// Tokenizes the first line of a move list into `<side> <move> <EOM>` plies.
///
/// Move numbers sit at every third token and are skipped. A list that opens
/// with a continuation marker (`12...`) starts with Black to move.
pub fn ply_tokens(move_text: &str) -> Vec<String> {
    let first_line = move_text.lines().next().unwrap_or_default();
    let mut tokens = first_line.split_whitespace().peekable();

    let mut position = 0usize;
    if tokens.peek().is_some_and(|token| token.contains("...")) {
        tokens.next();
        position = 2;
    }

    let mut plies = Vec::new();
    for token in tokens {
        let side = match position % 3 {
            1 => Some(Color::White),
            2 => Some(Color::Black),
            _ => None,
        };
        if let Some(side) = side {
            plies.push(format!("{} {} {END_OF_MOVE}", side.as_str(), move_token(token)));
        }
        position += 1;
    }
    plies
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_piece_moves_and_captures() {
        assert_eq!(move_token("Nf3+"), "_knight f3");
        assert_eq!(move_token("Bxc6"), "_bishop X c6");
        assert_eq!(move_token("e4"), "_pawn e4");
        assert_eq!(move_token("exd5"), "_pawn e X d5");
        assert_eq!(move_token("Qh5#"), "_queen h5");
        assert_eq!(move_token("O-O-O"), STRANGE_MOVE);
        assert_eq!(move_token("e8=Q"), STRANGE_MOVE);
    }

    #[test]
    fn move_list_alternates_sides_and_skips_numbers() {
        assert_eq!(
            ply_tokens("1. e4 e5 2. Nf3\nlayout residue"),
            vec![
                "white _pawn e4 <EOM>",
                "black _pawn e5 <EOM>",
                "white _knight f3 <EOM>",
            ]
        );
    }

    #[test]
    fn continuation_marker_starts_with_black() {
        assert_eq!(
            ply_tokens("12... Bxc6 13. Qd2"),
            vec!["black _bishop X c6 <EOM>", "white _queen d2 <EOM>"]
        );
    }

    #[test]
    fn empty_move_text_has_no_plies() {
        assert!(ply_tokens("").is_empty());
        assert!(ply_tokens("   \n1. e4").is_empty());
    }
}
