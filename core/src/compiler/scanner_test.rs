use super::scanner::{Scanner, TokenKind};

fn kinds(source: &str) -> Vec<TokenKind> {
    let mut scanner = Scanner::new(source);
    let mut out = Vec::new();
    loop {
        let token = scanner.scan_token();
        if token.kind == TokenKind::Eof {
            break;
        }
        out.push(token.kind);
    }
    out
}

#[test]
fn scans_compound_assignment_operators_distinctly_from_their_plain_forms() {
    assert_eq!(
        kinds("+= -= *= /="),
        vec![
            TokenKind::PlusEqual,
            TokenKind::MinusEqual,
            TokenKind::StarEqual,
            TokenKind::SlashEqual,
        ]
    );
    assert_eq!(
        kinds("+ - * /"),
        vec![TokenKind::Plus, TokenKind::Minus, TokenKind::Star, TokenKind::Slash]
    );
}

#[test]
fn recognizes_every_reserved_keyword() {
    let source = "and break case class const def default else false for fun if next nil or print return self super switch true var while";
    assert_eq!(
        kinds(source),
        vec![
            TokenKind::And,
            TokenKind::Break,
            TokenKind::Case,
            TokenKind::Class,
            TokenKind::Const,
            TokenKind::Def,
            TokenKind::Default,
            TokenKind::Else,
            TokenKind::False,
            TokenKind::For,
            TokenKind::Fun,
            TokenKind::If,
            TokenKind::Next,
            TokenKind::Nil,
            TokenKind::Or,
            TokenKind::Print,
            TokenKind::Return,
            TokenKind::SelfKw,
            TokenKind::Super,
            TokenKind::Switch,
            TokenKind::True,
            TokenKind::Var,
            TokenKind::While,
        ]
    );
}

#[test]
fn ternary_operators_scan_as_question_mark_and_colon() {
    assert_eq!(
        kinds("a ? b : c"),
        vec![
            TokenKind::Identifier,
            TokenKind::QuestionMark,
            TokenKind::Identifier,
            TokenKind::Colon,
            TokenKind::Identifier,
        ]
    );
}

#[test]
fn line_comments_are_skipped_but_not_a_lone_slash() {
    let mut scanner = Scanner::new("1 // comment\n/ 2");
    let first = scanner.scan_token();
    assert_eq!(first.kind, TokenKind::Number);
    assert_eq!(first.line, 1);
    let slash = scanner.scan_token();
    assert_eq!(slash.kind, TokenKind::Slash);
    assert_eq!(slash.line, 2);
}

#[test]
fn unterminated_string_reports_an_error_token() {
    let mut scanner = Scanner::new("\"abc");
    let token = scanner.scan_token();
    assert_eq!(token.kind, TokenKind::Error);
    assert_eq!(token.lexeme, "Unterminated string.");
}

#[test]
fn identifiers_keep_digits_and_underscores_after_the_first_letter() {
    let mut scanner = Scanner::new("_foo_123 bar");
    let first = scanner.scan_token();
    assert_eq!(first.kind, TokenKind::Identifier);
    assert_eq!(first.lexeme, "_foo_123");
}

#[test]
fn brackets_scan_even_though_nothing_parses_them() {
    assert_eq!(
        kinds("[1]"),
        vec![TokenKind::LeftBracket, TokenKind::Number, TokenKind::RightBracket]
    );
}
