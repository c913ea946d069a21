use logos::Logos;

use crate::ast::Span;

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
#[logos(skip r"/\*([^*]|\*[^/])*\*/")]
pub enum Token {
    // Types
    #[token("int")]
    Int,
    #[token("str")]
    Str,
    #[token("bool")]
    Bool,
    #[token("void")]
    Void,
    #[token("float")]
    Float,

    // Storage / linkage
    #[token("static")]
    Static,
    #[token("world")]
    World,
    #[token("global")]
    Global,
    #[token("const")]
    Const,
    #[token("typedef")]
    Typedef,
    #[token("extern")]
    Extern,

    // Declarations
    #[token("script")]
    Script,
    #[token("function")]
    Function,

    // Statements
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("switch")]
    Switch,
    #[token("case")]
    Case,
    #[token("default")]
    Default,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("goto")]
    Goto,
    #[token("return")]
    Return,
    #[token("delay")]
    Delay,
    #[token("suspend")]
    Suspend,
    #[token("terminate")]
    Terminate,
    #[token("restart")]
    Restart,
    #[token("print")]
    Print,

    #[token("true")]
    True,
    #[token("false")]
    False,

    // Punctuation
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(";")]
    Semi,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token("?")]
    Question,

    // Operators (longest first where prefixes overlap)
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("==")]
    EqEq,
    #[token("!=")]
    Ne,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("+=")]
    PlusEq,
    #[token("-=")]
    MinusEq,
    #[token("=")]
    Assign,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("!")]
    Bang,
    #[token("~")]
    Tilde,

    // Literals
    #[regex(r"0[xX][0-9a-fA-F]+", |lex| i64::from_str_radix(&lex.slice()[2..], 16).ok())]
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok(), priority = 3)]
    IntLit(i64),

    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    FloatLit(f64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    StrLit(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string(), priority = 2)]
    Ident(String),
}

fn unescape(quoted: &str) -> Option<String> {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            _ => return None,
        }
    }
    Some(out)
}

/// Lex a compilation unit into tokens with byte spans.
pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let range = lexer.span();
        let span = Span { start: range.start, end: range.end };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                return Err(LexError {
                    span,
                    snippet: source[range].to_string(),
                });
            }
        }
    }

    Ok(tokens)
}

#[derive(Debug, thiserror::Error)]
#[error("unexpected character(s) '{snippet}'")]
pub struct LexError {
    pub span: Span,
    pub snippet: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        lex(source).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn lex_static_decl() {
        let toks = kinds("static int x = 2 + 3;");
        assert_eq!(
            toks,
            vec![
                Token::Static,
                Token::Int,
                Token::Ident("x".into()),
                Token::Assign,
                Token::IntLit(2),
                Token::Plus,
                Token::IntLit(3),
                Token::Semi,
            ]
        );
    }

    #[test]
    fn lex_hex_literal() {
        assert_eq!(kinds("0x1F"), vec![Token::IntLit(31)]);
    }

    #[test]
    fn lex_float_literal() {
        assert_eq!(kinds("1.5"), vec![Token::FloatLit(1.5)]);
    }

    #[test]
    fn lex_string_escapes() {
        assert_eq!(
            kinds(r#""a\nb""#),
            vec![Token::StrLit("a\nb".to_string())]
        );
    }

    #[test]
    fn lex_comments_skipped() {
        let toks = kinds("int x; // trailing\n/* block */ int y;");
        assert_eq!(toks.len(), 6);
    }

    #[test]
    fn lex_compound_operators() {
        assert_eq!(
            kinds("<< >> <= == != && || +="),
            vec![
                Token::Shl,
                Token::Shr,
                Token::Le,
                Token::EqEq,
                Token::Ne,
                Token::AndAnd,
                Token::OrOr,
                Token::PlusEq,
            ]
        );
    }

    #[test]
    fn lex_error_reports_snippet() {
        let err = lex("int x = @;").unwrap_err();
        assert_eq!(err.snippet, "@");
        assert_eq!(err.span.start, 8);
    }

    #[test]
    fn lex_spans_are_byte_ranges() {
        let toks = lex("int abc").unwrap();
        assert_eq!(toks[1].1, Span { start: 4, end: 7 });
    }
}
