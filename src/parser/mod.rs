use crate::ast::*;
use crate::lexer::Token;

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ParseError {
    pub span: Span,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

/// Parse a lexed compilation unit. The first error aborts the unit.
pub fn parse(tokens: Vec<(Token, Span)>) -> Result<Program> {
    Parser::new(tokens).parse_program()
}

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn token_at(&self, idx: usize) -> Option<&Token> {
        self.tokens.get(idx).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| *s)
            .unwrap_or_else(|| {
                self.tokens
                    .last()
                    .map(|(_, s)| *s)
                    .unwrap_or(Span::UNKNOWN)
            })
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span> {
        match self.peek() {
            Some(tok) if tok == expected => {
                let span = self.peek_span();
                self.advance();
                Ok(span)
            }
            Some(tok) => Err(self.error(format!("expected {:?}, got {:?}", expected, tok))),
            None => Err(self.error(format!("expected {:?}, got end of input", expected))),
        }
    }

    fn expect_ident(&mut self) -> Result<Spanned<String>> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                let span = self.peek_span();
                self.advance();
                Ok(Spanned::new(name, span))
            }
            Some(tok) => Err(self.error(format!("expected identifier, got {:?}", tok))),
            None => Err(self.error("expected identifier, got end of input".into())),
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError { span: self.peek_span(), message }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // ---- Top-level parsing ----

    pub fn parse_program(&mut self) -> Result<Program> {
        let mut declarations = Vec::new();
        while !self.at_end() {
            declarations.push(self.parse_decl()?);
        }
        Ok(Program { declarations, source: None })
    }

    fn parse_decl(&mut self) -> Result<Decl> {
        let start = self.peek_span();
        match self.peek() {
            Some(Token::Const) => self.parse_const_decl(),
            Some(Token::Typedef) => self.parse_typedef(),
            Some(Token::Script) => self.parse_script(),
            Some(Token::Extern) | Some(Token::Function) => self.parse_function(),
            Some(Token::Static | Token::World | Token::Global | Token::Int | Token::Str | Token::Bool) => {
                let decl = self.parse_var_decl()?;
                Ok(Decl::Var(decl))
            }
            // `tick x;` — a declaration using a typedef name.
            Some(Token::Ident(_))
                if matches!(self.token_at(self.pos + 1), Some(Token::Ident(_))) =>
            {
                let decl = self.parse_var_decl()?;
                Ok(Decl::Var(decl))
            }
            Some(tok) => Err(ParseError {
                span: start,
                message: format!("expected declaration, got {:?}", tok),
            }),
            None => Err(self.error("expected declaration, got end of input".into())),
        }
    }

    fn parse_storage_spec(&mut self) -> StorageSpec {
        match self.peek() {
            Some(Token::Static) => {
                self.advance();
                StorageSpec::Static
            }
            Some(Token::World) => {
                self.advance();
                StorageSpec::World
            }
            Some(Token::Global) => {
                self.advance();
                StorageSpec::Global
            }
            _ => StorageSpec::Default,
        }
    }

    fn parse_type(&mut self) -> Result<Type> {
        match self.peek() {
            Some(Token::Int) => {
                self.advance();
                Ok(Type::Int)
            }
            Some(Token::Str) => {
                self.advance();
                Ok(Type::Str)
            }
            Some(Token::Bool) => {
                self.advance();
                Ok(Type::Bool)
            }
            Some(Token::Void) => {
                self.advance();
                Ok(Type::Void)
            }
            Some(Token::Ident(_)) => {
                let name = self.expect_ident()?;
                Ok(Type::Named(name.node))
            }
            Some(tok) => Err(self.error(format!("expected type, got {:?}", tok))),
            None => Err(self.error("expected type, got end of input".into())),
        }
    }

    fn parse_var_decl(&mut self) -> Result<VarDecl> {
        let start = self.peek_span();
        let storage = self.parse_storage_spec();
        let ty = self.parse_type()?;
        let name = self.expect_ident()?;

        let size = if self.eat(&Token::LBracket) {
            let count = self.parse_expr()?;
            self.expect(&Token::RBracket)?;
            Some(count)
        } else {
            None
        };

        let init = if self.eat(&Token::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let end = self.expect(&Token::Semi)?;
        Ok(VarDecl {
            name: name.node,
            ty,
            storage,
            size,
            init,
            span: start.merge(end),
        })
    }

    fn parse_typedef(&mut self) -> Result<Decl> {
        let start = self.expect(&Token::Typedef)?;
        let ty = self.parse_type()?;
        let name = self.expect_ident()?;
        let end = self.expect(&Token::Semi)?;
        Ok(Decl::Typedef {
            name: name.node,
            ty,
            span: start.merge(end),
        })
    }

    fn parse_const_decl(&mut self) -> Result<Decl> {
        let start = self.expect(&Token::Const)?;
        let ty = self.parse_type()?;
        let name = self.expect_ident()?;
        self.expect(&Token::Assign)?;
        let value = self.parse_expr()?;
        let end = self.expect(&Token::Semi)?;
        Ok(Decl::Const {
            name: name.node,
            ty,
            value,
            span: start.merge(end),
        })
    }

    /// `script <number> (params)? { body }` — the number is an int literal or
    /// a constant name; anything richer belongs in a `const`.
    fn parse_script(&mut self) -> Result<Decl> {
        let start = self.expect(&Token::Script)?;
        let num_span = self.peek_span();
        let number = match self.peek().cloned() {
            Some(Token::IntLit(n)) => {
                self.advance();
                Spanned::new(Expr::Int(n), num_span)
            }
            Some(Token::Ident(name)) => {
                self.advance();
                Spanned::new(Expr::Ref(name), num_span)
            }
            _ => return Err(self.error("expected script number".into())),
        };

        let mut params = Vec::new();
        if self.eat(&Token::LParen) {
            params = self.parse_params()?;
            self.expect(&Token::RParen)?;
        }

        let body = self.parse_block()?;
        let span = start.merge(self.prev_span());
        Ok(Decl::Script { number, params, body, span })
    }

    fn parse_function(&mut self) -> Result<Decl> {
        let start = self.peek_span();
        let linkage = if self.eat(&Token::Extern) {
            Linkage::External
        } else {
            Linkage::Internal
        };
        self.expect(&Token::Function)?;
        let return_type = self.parse_type()?;
        let name = self.expect_ident()?;
        self.expect(&Token::LParen)?;
        let params = self.parse_params()?;
        self.expect(&Token::RParen)?;

        let body = if self.eat(&Token::Semi) {
            None
        } else {
            Some(self.parse_block()?)
        };

        if body.is_some() && linkage == Linkage::External {
            return Err(ParseError {
                span: start,
                message: format!("extern function '{}' must not have a body", name.node),
            });
        }

        let span = start.merge(self.prev_span());
        Ok(Decl::Function {
            name: name.node,
            linkage,
            return_type,
            params,
            body,
            span,
        })
    }

    fn parse_params(&mut self) -> Result<Vec<Param>> {
        let mut params = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            return Ok(params);
        }
        loop {
            let ty = self.parse_type()?;
            // Parameter names are optional in prototypes.
            let name = match self.peek() {
                Some(Token::Ident(_)) => self.expect_ident()?.node,
                _ => format!("_arg{}", params.len()),
            };
            params.push(Param { name, ty });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(params)
    }

    fn prev_span(&self) -> Span {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map(|(_, s)| *s)
            .unwrap_or(Span::UNKNOWN)
    }

    // ---- Statements ----

    fn parse_block(&mut self) -> Result<Vec<Spanned<Stmt>>> {
        self.expect(&Token::LBrace)?;
        let mut body = Vec::new();
        while !matches!(self.peek(), Some(Token::RBrace)) {
            if self.at_end() {
                return Err(self.error("unterminated block".into()));
            }
            body.push(self.parse_stmt()?);
        }
        self.expect(&Token::RBrace)?;
        Ok(body)
    }

    fn parse_stmt(&mut self) -> Result<Spanned<Stmt>> {
        let start = self.peek_span();
        let stmt = match self.peek() {
            Some(Token::Static | Token::World | Token::Global) => {
                Stmt::Var(self.parse_var_decl()?)
            }
            // `int(` is a cast expression, `int x` a declaration.
            Some(Token::Int | Token::Str | Token::Bool)
                if !matches!(self.token_at(self.pos + 1), Some(Token::LParen)) =>
            {
                Stmt::Var(self.parse_var_decl()?)
            }
            Some(Token::Const) => {
                self.advance();
                let ty = self.parse_type()?;
                let name = self.expect_ident()?;
                self.expect(&Token::Assign)?;
                let value = self.parse_expr()?;
                self.expect(&Token::Semi)?;
                Stmt::Const { name: name.node, ty, value }
            }
            Some(Token::If) => self.parse_if()?,
            Some(Token::While) => {
                self.advance();
                self.expect(&Token::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                let body = self.parse_body_or_stmt()?;
                Stmt::While { cond, body }
            }
            Some(Token::For) => self.parse_for()?,
            Some(Token::Switch) => self.parse_switch()?,
            Some(Token::Break) => {
                self.advance();
                self.expect(&Token::Semi)?;
                Stmt::Break
            }
            Some(Token::Continue) => {
                self.advance();
                self.expect(&Token::Semi)?;
                Stmt::Continue
            }
            Some(Token::Goto) => {
                self.advance();
                if self.eat(&Token::Case) {
                    let value = self.parse_expr()?;
                    self.expect(&Token::Semi)?;
                    Stmt::GotoCase(value)
                } else {
                    let name = self.expect_ident()?;
                    self.expect(&Token::Semi)?;
                    Stmt::Goto(name)
                }
            }
            Some(Token::Return) => {
                self.advance();
                let value = if matches!(self.peek(), Some(Token::Semi)) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(&Token::Semi)?;
                Stmt::Return(value)
            }
            Some(Token::Delay) => {
                self.advance();
                self.expect(&Token::LParen)?;
                let ticks = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                self.expect(&Token::Semi)?;
                Stmt::Delay(ticks)
            }
            Some(Token::Suspend) => {
                self.advance();
                self.expect(&Token::Semi)?;
                Stmt::Suspend
            }
            Some(Token::Terminate) => {
                self.advance();
                self.expect(&Token::Semi)?;
                Stmt::Terminate
            }
            Some(Token::Restart) => {
                self.advance();
                self.expect(&Token::Semi)?;
                Stmt::Restart
            }
            Some(Token::Print) => {
                self.advance();
                self.expect(&Token::LParen)?;
                let mut args = Vec::new();
                if !matches!(self.peek(), Some(Token::RParen)) {
                    loop {
                        args.push(self.parse_expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Token::RParen)?;
                self.expect(&Token::Semi)?;
                Stmt::Print(args)
            }
            Some(Token::LBrace) => Stmt::Block(self.parse_block()?),
            // `name:` is a goto label.
            Some(Token::Ident(_))
                if matches!(self.token_at(self.pos + 1), Some(Token::Colon)) =>
            {
                let name = self.expect_ident()?;
                self.expect(&Token::Colon)?;
                Stmt::Label(name.node)
            }
            // `tick t;` — declaration with a typedef name.
            Some(Token::Ident(_))
                if matches!(self.token_at(self.pos + 1), Some(Token::Ident(_))) =>
            {
                Stmt::Var(self.parse_var_decl()?)
            }
            Some(_) => self.parse_assign_or_expr()?,
            None => return Err(self.error("expected statement, got end of input".into())),
        };
        Ok(Spanned::new(stmt, start.merge(self.prev_span())))
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        self.expect(&Token::If)?;
        self.expect(&Token::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        let then_body = self.parse_body_or_stmt()?;
        let else_body = if self.eat(&Token::Else) {
            if matches!(self.peek(), Some(Token::If)) {
                let start = self.peek_span();
                let nested = self.parse_if()?;
                Some(vec![Spanned::new(nested, start.merge(self.prev_span()))])
            } else {
                Some(self.parse_body_or_stmt()?)
            }
        } else {
            None
        };
        Ok(Stmt::If { cond, then_body, else_body })
    }

    fn parse_for(&mut self) -> Result<Stmt> {
        self.expect(&Token::For)?;
        self.expect(&Token::LParen)?;
        let init = if self.eat(&Token::Semi) {
            None
        } else {
            Some(Box::new(self.parse_stmt()?))
        };
        let cond = if matches!(self.peek(), Some(Token::Semi)) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(&Token::Semi)?;
        let step = if matches!(self.peek(), Some(Token::RParen)) {
            None
        } else {
            Some(Box::new(self.parse_simple_stmt()?))
        };
        self.expect(&Token::RParen)?;
        let body = self.parse_body_or_stmt()?;
        Ok(Stmt::For { init, cond, step, body })
    }

    /// An assignment or expression without a trailing `;` (for-loop step).
    fn parse_simple_stmt(&mut self) -> Result<Spanned<Stmt>> {
        let start = self.peek_span();
        let stmt = self.assign_or_expr_core()?;
        Ok(Spanned::new(stmt, start.merge(self.prev_span())))
    }

    fn parse_switch(&mut self) -> Result<Stmt> {
        self.expect(&Token::Switch)?;
        self.expect(&Token::LParen)?;
        let subject = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        self.expect(&Token::LBrace)?;

        let mut arms = Vec::new();
        while !matches!(self.peek(), Some(Token::RBrace)) {
            let case = if self.eat(&Token::Case) {
                let value = self.parse_expr()?;
                self.expect(&Token::Colon)?;
                Some(value)
            } else if self.eat(&Token::Default) {
                self.expect(&Token::Colon)?;
                None
            } else {
                return Err(self.error("expected 'case' or 'default'".into()));
            };

            let mut body = Vec::new();
            while !matches!(
                self.peek(),
                Some(Token::Case | Token::Default | Token::RBrace) | None
            ) {
                body.push(self.parse_stmt()?);
            }
            arms.push(SwitchArm { case, body });
        }
        self.expect(&Token::RBrace)?;
        Ok(Stmt::Switch { subject, arms })
    }

    fn parse_body_or_stmt(&mut self) -> Result<Vec<Spanned<Stmt>>> {
        if matches!(self.peek(), Some(Token::LBrace)) {
            self.parse_block()
        } else {
            Ok(vec![self.parse_stmt()?])
        }
    }

    fn parse_assign_or_expr(&mut self) -> Result<Stmt> {
        let stmt = self.assign_or_expr_core()?;
        self.expect(&Token::Semi)?;
        Ok(stmt)
    }

    fn assign_or_expr_core(&mut self) -> Result<Stmt> {
        let expr = self.parse_expr()?;

        let op = match self.peek() {
            Some(Token::Assign) => Some(AssignOp::Set),
            Some(Token::PlusEq) => Some(AssignOp::Add),
            Some(Token::MinusEq) => Some(AssignOp::Sub),
            _ => None,
        };

        let Some(op) = op else {
            return Ok(Stmt::Expr(expr));
        };
        self.advance();
        let value = self.parse_expr()?;

        match expr.node {
            Expr::Ref(name) => Ok(Stmt::Assign {
                target: Spanned::new(name, expr.span),
                index: None,
                op,
                value,
            }),
            Expr::Index { name, index } => Ok(Stmt::Assign {
                target: name,
                index: Some(*index),
                op,
                value,
            }),
            _ => Err(ParseError {
                span: expr.span,
                message: "left side of assignment must be a variable or array element".into(),
            }),
        }
    }

    // ---- Expressions (C precedence, lowest first) ----

    fn parse_expr(&mut self) -> Result<Spanned<Expr>> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Spanned<Expr>> {
        let cond = self.parse_or()?;
        if !self.eat(&Token::Question) {
            return Ok(cond);
        }
        let then = self.parse_expr()?;
        self.expect(&Token::Colon)?;
        let otherwise = self.parse_expr()?;
        let span = cond.span.merge(otherwise.span);
        Ok(Spanned::new(
            Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            span,
        ))
    }

    fn binary_level<F>(&mut self, next: F, table: &[(Token, BinOp)]) -> Result<Spanned<Expr>>
    where
        F: Fn(&mut Self) -> Result<Spanned<Expr>>,
    {
        let mut left = next(self)?;
        'outer: loop {
            for (tok, op) in table {
                if self.peek() == Some(tok) {
                    self.advance();
                    let right = next(self)?;
                    let span = left.span.merge(right.span);
                    left = Spanned::new(
                        Expr::Binary {
                            op: *op,
                            left: Box::new(left),
                            right: Box::new(right),
                        },
                        span,
                    );
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn parse_or(&mut self) -> Result<Spanned<Expr>> {
        self.binary_level(Self::parse_and, &[(Token::OrOr, BinOp::Or)])
    }

    fn parse_and(&mut self) -> Result<Spanned<Expr>> {
        self.binary_level(Self::parse_bitor, &[(Token::AndAnd, BinOp::And)])
    }

    fn parse_bitor(&mut self) -> Result<Spanned<Expr>> {
        self.binary_level(Self::parse_bitxor, &[(Token::Pipe, BinOp::BitOr)])
    }

    fn parse_bitxor(&mut self) -> Result<Spanned<Expr>> {
        self.binary_level(Self::parse_bitand, &[(Token::Caret, BinOp::BitXor)])
    }

    fn parse_bitand(&mut self) -> Result<Spanned<Expr>> {
        self.binary_level(Self::parse_equality, &[(Token::Amp, BinOp::BitAnd)])
    }

    fn parse_equality(&mut self) -> Result<Spanned<Expr>> {
        self.binary_level(
            Self::parse_relational,
            &[(Token::EqEq, BinOp::Eq), (Token::Ne, BinOp::Ne)],
        )
    }

    fn parse_relational(&mut self) -> Result<Spanned<Expr>> {
        self.binary_level(
            Self::parse_shift,
            &[
                (Token::Le, BinOp::Le),
                (Token::Ge, BinOp::Ge),
                (Token::Lt, BinOp::Lt),
                (Token::Gt, BinOp::Gt),
            ],
        )
    }

    fn parse_shift(&mut self) -> Result<Spanned<Expr>> {
        self.binary_level(
            Self::parse_additive,
            &[(Token::Shl, BinOp::Shl), (Token::Shr, BinOp::Shr)],
        )
    }

    fn parse_additive(&mut self) -> Result<Spanned<Expr>> {
        self.binary_level(
            Self::parse_multiplicative,
            &[(Token::Plus, BinOp::Add), (Token::Minus, BinOp::Sub)],
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Spanned<Expr>> {
        self.binary_level(
            Self::parse_unary,
            &[
                (Token::Star, BinOp::Mul),
                (Token::Slash, BinOp::Div),
                (Token::Percent, BinOp::Mod),
            ],
        )
    }

    fn parse_unary(&mut self) -> Result<Spanned<Expr>> {
        let start = self.peek_span();
        let op = match self.peek() {
            Some(Token::Minus) => Some(UnaryOp::Neg),
            Some(Token::Bang) => Some(UnaryOp::Not),
            Some(Token::Tilde) => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            let span = start.merge(operand.span);
            return Ok(Spanned::new(Expr::Unary { op, operand: Box::new(operand) }, span));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Spanned<Expr>> {
        let span = self.peek_span();
        match self.peek().cloned() {
            Some(Token::IntLit(n)) => {
                self.advance();
                Ok(Spanned::new(Expr::Int(n), span))
            }
            Some(Token::FloatLit(f)) => {
                self.advance();
                Ok(Spanned::new(Expr::Float(f), span))
            }
            Some(Token::StrLit(s)) => {
                self.advance();
                Ok(Spanned::new(Expr::Str(s), span))
            }
            Some(Token::True) => {
                self.advance();
                Ok(Spanned::new(Expr::Bool(true), span))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Spanned::new(Expr::Bool(false), span))
            }
            Some(Token::Int) => self.parse_cast(UnaryOp::ToInt),
            Some(Token::Float) => self.parse_cast(UnaryOp::ToFloat),
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_expr()?;
                let end = self.expect(&Token::RParen)?;
                Ok(Spanned::new(inner.node, span.merge(end)))
            }
            Some(Token::Ident(name)) => {
                self.advance();
                let name = Spanned::new(name, span);
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                    }
                    let end = self.expect(&Token::RParen)?;
                    Ok(Spanned::new(Expr::Call { function: name, args }, span.merge(end)))
                } else if self.eat(&Token::LBracket) {
                    let index = self.parse_expr()?;
                    let end = self.expect(&Token::RBracket)?;
                    Ok(Spanned::new(
                        Expr::Index { name, index: Box::new(index) },
                        span.merge(end),
                    ))
                } else {
                    Ok(Spanned::new(Expr::Ref(name.node), span))
                }
            }
            Some(tok) => Err(self.error(format!("expected expression, got {:?}", tok))),
            None => Err(self.error("expected expression, got end of input".into())),
        }
    }

    fn parse_cast(&mut self, op: UnaryOp) -> Result<Spanned<Expr>> {
        let start = self.peek_span();
        self.advance();
        self.expect(&Token::LParen)?;
        let operand = self.parse_expr()?;
        let end = self.expect(&Token::RParen)?;
        Ok(Spanned::new(
            Expr::Unary { op, operand: Box::new(operand) },
            start.merge(end),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse_ok(source: &str) -> Program {
        parse(lex(source).unwrap()).unwrap()
    }

    #[test]
    fn parse_static_with_initializer() {
        let prog = parse_ok("static int x = 2 + 3;");
        let Decl::Var(decl) = &prog.declarations[0] else {
            panic!("expected var decl");
        };
        assert_eq!(decl.name, "x");
        assert_eq!(decl.storage, StorageSpec::Static);
        assert!(matches!(decl.init.as_ref().unwrap().node, Expr::Binary { op: BinOp::Add, .. }));
    }

    #[test]
    fn parse_array_decl_single_size() {
        let prog = parse_ok("world int arr[100];");
        let Decl::Var(decl) = &prog.declarations[0] else {
            panic!("expected var decl");
        };
        assert_eq!(decl.storage, StorageSpec::World);
        assert!(matches!(decl.size.as_ref().unwrap().node, Expr::Int(100)));
    }

    #[test]
    fn parse_script_with_body() {
        let prog = parse_ok("script 1 { print(5); }");
        let Decl::Script { number, body, .. } = &prog.declarations[0] else {
            panic!("expected script");
        };
        assert!(matches!(number.node, Expr::Int(1)));
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn parse_function_and_extern() {
        let prog = parse_ok("function int f(int a) { return a; } extern function int probe(int);");
        assert!(matches!(
            &prog.declarations[0],
            Decl::Function { linkage: Linkage::Internal, body: Some(_), .. }
        ));
        let Decl::Function { linkage, body, params, .. } = &prog.declarations[1] else {
            panic!("expected function");
        };
        assert_eq!(*linkage, Linkage::External);
        assert!(body.is_none());
        assert_eq!(params[0].name, "_arg0");
    }

    #[test]
    fn extern_with_body_rejected() {
        let err = parse(lex("extern function int f() { }").unwrap()).unwrap_err();
        assert!(err.message.contains("must not have a body"));
    }

    #[test]
    fn parse_switch_with_goto_case() {
        let prog = parse_ok(
            "script 1 { switch (3) { case 1: break; default: goto case 5; case 5: break; } }",
        );
        let Decl::Script { body, .. } = &prog.declarations[0] else {
            panic!("expected script");
        };
        let Stmt::Switch { arms, .. } = &body[0].node else {
            panic!("expected switch");
        };
        assert_eq!(arms.len(), 3);
        assert!(arms[1].case.is_none());
        assert!(matches!(arms[1].body[0].node, Stmt::GotoCase(_)));
    }

    #[test]
    fn parse_precedence() {
        let prog = parse_ok("const int k = 1 + 2 * 3;");
        let Decl::Const { value, .. } = &prog.declarations[0] else {
            panic!("expected const");
        };
        // Must parse as 1 + (2 * 3).
        let Expr::Binary { op: BinOp::Add, right, .. } = &value.node else {
            panic!("expected top-level add, got {:?}", value.node);
        };
        assert!(matches!(right.node, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn parse_cast_vs_decl() {
        // `int(e)` is a cast expression, `int x;` a declaration.
        let prog = parse_ok("script 1 { int y; y = int(1.5); }");
        let Decl::Script { body, .. } = &prog.declarations[0] else {
            panic!("expected script");
        };
        assert!(matches!(body[0].node, Stmt::Var(_)));
        let Stmt::Assign { value, .. } = &body[1].node else {
            panic!("expected assignment");
        };
        assert!(matches!(value.node, Expr::Unary { op: UnaryOp::ToInt, .. }));
    }

    #[test]
    fn parse_label_and_goto() {
        let prog = parse_ok("script 1 { top: delay(1); goto top; }");
        let Decl::Script { body, .. } = &prog.declarations[0] else {
            panic!("expected script");
        };
        assert!(matches!(&body[0].node, Stmt::Label(n) if n == "top"));
        assert!(matches!(&body[2].node, Stmt::Goto(n) if n.node == "top"));
    }

    #[test]
    fn parse_for_loop() {
        let prog = parse_ok("script 1 { for (int i = 0; i < 10; i += 1) { print(i); } }");
        let Decl::Script { body, .. } = &prog.declarations[0] else {
            panic!("expected script");
        };
        let Stmt::For { init, cond, step, .. } = &body[0].node else {
            panic!("expected for");
        };
        assert!(init.is_some() && cond.is_some() && step.is_some());
    }

    #[test]
    fn parse_ternary() {
        let prog = parse_ok("const int k = 1 < 2 ? 10 : 20;");
        let Decl::Const { value, .. } = &prog.declarations[0] else {
            panic!("expected const");
        };
        assert!(matches!(value.node, Expr::Ternary { .. }));
    }

    #[test]
    fn parse_typedef_and_named_type() {
        let prog = parse_ok("typedef int tick; tick t = 3;");
        assert!(matches!(&prog.declarations[0], Decl::Typedef { name, ty: Type::Int, .. } if name == "tick"));
        let Decl::Var(decl) = &prog.declarations[1] else {
            panic!("expected var decl");
        };
        assert_eq!(decl.ty, Type::Named("tick".to_string()));
    }

    #[test]
    fn parse_error_on_garbage() {
        let err = parse(lex("static static;").unwrap()).unwrap_err();
        assert!(err.message.contains("expected type"));
    }
}
