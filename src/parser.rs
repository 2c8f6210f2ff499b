//! Loader for textual IR modules.
//!
//! Accepts an LLVM-assembly-flavored subset: module globals, `define` /
//! `declare`, the integer/aggregate instruction set the runtime executes,
//! and `i1`..`i64` / `ptr` / array / struct types. Unknown attributes
//! commonly produced by frontends (`nsw`, `inbounds`, `dso_local`, ...)
//! are skipped so unoptimized compiler output parses as-is.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use thiserror::Error;

use crate::ir::{
    BinOp, Block, Func, FuncId, GlobalVar, Instr, Module, Op, Pred, Type, TypeId, Value, ValueId,
};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("line {line}: unexpected character {c:?}")]
    UnexpectedChar { line: u32, c: char },
    #[error("line {line}: expected {expected}, found {found}")]
    Expected {
        line: u32,
        expected: String,
        found: String,
    },
    #[error("line {line}: unknown instruction '{name}'")]
    UnknownInstr { line: u32, name: String },
    #[error("line {line}: unknown type '{name}'")]
    UnknownType { line: u32, name: String },
    #[error("use of undefined value %{0}")]
    UndefinedValue(String),
    #[error("use of undefined label %{0}")]
    UndefinedLabel(String),
    #[error("call to undefined function @{0}")]
    UndefinedFunction(String),
    #[error("use of undefined global @{0}")]
    UndefinedGlobal(String),
    #[error("unexpected end of input")]
    Eof,
}

/// Read and parse a module from a file.
pub fn load_module(path: &Path) -> Result<Module, ParseError> {
    let src = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_module(&src)
}

/// Parse a module from source text.
pub fn parse_module(src: &str) -> Result<Module, ParseError> {
    let tokens = lex(src)?;
    Parser::new(tokens).parse()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// `@name`
    Global(String),
    /// `%name`
    Local(String),
    /// Bare word: keyword, mnemonic or type name
    Word(String),
    Int(i64),
    Str(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Equals,
    Colon,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Token::Global(n) => write!(f, "@{n}"),
            Token::Local(n) => write!(f, "%{n}"),
            Token::Word(w) => write!(f, "{w}"),
            Token::Int(i) => write!(f, "{i}"),
            Token::Str(_) => write!(f, "string"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Equals => write!(f, "="),
            Token::Colon => write!(f, ":"),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$' | '-')
}

fn lex(src: &str) -> Result<Vec<(Token, u32)>, ParseError> {
    let mut tokens = Vec::new();
    let mut line = 1u32;
    let mut chars = src.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            ';' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '"' => {
                let mut s = String::new();
                for c in chars.by_ref() {
                    if c == '"' {
                        break;
                    }
                    s.push(c);
                }
                tokens.push((Token::Str(s), line));
            }
            '@' | '%' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if is_ident_char(c) {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = if c == '@' {
                    Token::Global(name)
                } else {
                    Token::Local(name)
                };
                tokens.push((token, line));
            }
            '(' => tokens.push((Token::LParen, line)),
            ')' => tokens.push((Token::RParen, line)),
            '{' => tokens.push((Token::LBrace, line)),
            '}' => tokens.push((Token::RBrace, line)),
            '[' => tokens.push((Token::LBracket, line)),
            ']' => tokens.push((Token::RBracket, line)),
            ',' => tokens.push((Token::Comma, line)),
            '=' => tokens.push((Token::Equals, line)),
            ':' => tokens.push((Token::Colon, line)),
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::from(c);
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = text
                    .parse::<i64>()
                    .map_err(|_| ParseError::UnexpectedChar { line, c })?;
                tokens.push((Token::Int(value), line));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&c) = chars.peek() {
                    if is_ident_char(c) {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Word(word), line));
            }
            c => return Err(ParseError::UnexpectedChar { line, c }),
        }
    }
    Ok(tokens)
}

/// Operand before names are resolved to ids.
#[derive(Debug, Clone)]
enum RawVal {
    Int(i64),
    Local(String),
    Global(String),
}

#[derive(Debug)]
struct RawInstr {
    result: Option<String>,
    op: RawOp,
}

#[derive(Debug)]
enum RawOp {
    Bin {
        op: BinOp,
        lhs: RawVal,
        rhs: RawVal,
    },
    Icmp {
        pred: Pred,
        lhs: RawVal,
        rhs: RawVal,
    },
    Alloca {
        ty: TypeId,
    },
    Load {
        ptr: RawVal,
    },
    Store {
        value: RawVal,
        ptr: RawVal,
    },
    Gep {
        source_ty: TypeId,
        base: RawVal,
        indices: Vec<RawVal>,
    },
    Phi {
        incoming: Vec<(RawVal, String)>,
    },
    Sext {
        value: RawVal,
    },
    Call {
        callee: String,
        args: Vec<RawVal>,
    },
    Ret {
        value: Option<RawVal>,
    },
    Br {
        dest: String,
    },
    CondBr {
        cond: RawVal,
        then_dest: String,
        else_dest: String,
    },
}

#[derive(Debug)]
struct RawBlock {
    label: String,
    instrs: Vec<RawInstr>,
}

// Frontend attributes that carry no meaning here.
const SKIPPED_WORDS: &[&str] = &[
    "dso_local",
    "local_unnamed_addr",
    "noundef",
    "signext",
    "zeroext",
    "nsw",
    "nuw",
    "exact",
    "inbounds",
];

struct Parser {
    tokens: Vec<(Token, u32)>,
    pos: usize,
    module: Module,
    next_value: u32,
    func_names: HashMap<String, FuncId>,
    global_names: HashMap<String, ValueId>,
}

impl Parser {
    fn new(tokens: Vec<(Token, u32)>) -> Self {
        Parser {
            tokens,
            pos: 0,
            module: Module::default(),
            next_value: 0,
            func_names: HashMap::new(),
            global_names: HashMap::new(),
        }
    }

    fn fresh_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek2(&self) -> Option<&Token> {
        self.tokens.get(self.pos + 1).map(|(t, _)| t)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|(_, l)| *l)
            .unwrap_or(0)
    }

    fn next(&mut self) -> Result<Token, ParseError> {
        let token = self
            .tokens
            .get(self.pos)
            .map(|(t, _)| t.clone())
            .ok_or(ParseError::Eof)?;
        self.pos += 1;
        Ok(token)
    }

    fn expected(&self, expected: &str, found: &Token) -> ParseError {
        ParseError::Expected {
            line: self.line(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    fn expect(&mut self, want: Token) -> Result<(), ParseError> {
        let got = self.next()?;
        if got == want {
            Ok(())
        } else {
            self.pos -= 1;
            Err(self.expected(&want.to_string(), &got))
        }
    }

    fn expect_word(&mut self, want: &str) -> Result<(), ParseError> {
        let got = self.next()?;
        match &got {
            Token::Word(w) if w == want => Ok(()),
            _ => {
                self.pos -= 1;
                Err(self.expected(want, &got))
            }
        }
    }

    fn skip_attrs(&mut self) {
        while let Some(Token::Word(w)) = self.peek() {
            if SKIPPED_WORDS.contains(&w.as_str()) {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn eat_comma(&mut self) -> bool {
        if self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Pre-register globals and function names so references resolve
    /// regardless of declaration order.
    fn scan_toplevel_names(&mut self) {
        let mut func_count = 0u32;
        let mut i = 0;
        while i < self.tokens.len() {
            match &self.tokens[i].0 {
                Token::Word(w) if w == "define" || w == "declare" => {
                    for (t, _) in &self.tokens[i + 1..] {
                        if let Token::Global(name) = t {
                            self.func_names.insert(name.clone(), FuncId(func_count));
                            func_count += 1;
                            break;
                        }
                    }
                }
                Token::Global(name) => {
                    let name = name.clone();
                    if self.tokens.get(i + 1).map(|(t, _)| t) == Some(&Token::Equals) {
                        let id = self.fresh_value();
                        self.global_names.insert(name, id);
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    fn parse(mut self) -> Result<Module, ParseError> {
        self.scan_toplevel_names();
        while let Some(token) = self.peek() {
            match token.clone() {
                Token::Word(w) if w == "define" => {
                    self.pos += 1;
                    self.parse_define()?;
                }
                Token::Word(w) if w == "declare" => {
                    self.pos += 1;
                    self.parse_declare()?;
                }
                Token::Word(w) if w == "target" => {
                    // target datalayout = "..." / target triple = "..."
                    self.pos += 1;
                    self.next()?;
                    self.expect(Token::Equals)?;
                    self.next()?;
                }
                Token::Word(w) if w == "source_filename" => {
                    self.pos += 1;
                    self.expect(Token::Equals)?;
                    self.next()?;
                }
                Token::Global(_) => self.parse_global()?,
                other => return Err(self.expected("top-level definition", &other)),
            }
        }
        Ok(self.module)
    }

    fn parse_global(&mut self) -> Result<(), ParseError> {
        let name = match self.next()? {
            Token::Global(n) => n,
            other => return Err(self.expected("@name", &other)),
        };
        self.expect(Token::Equals)?;
        self.skip_attrs();
        self.expect_word("global")?;
        self.parse_type()?;
        let init = match self.next()? {
            Token::Int(i) => i,
            other => return Err(self.expected("integer initializer", &other)),
        };
        let value_id = self.global_names[&name];
        self.module.globals.push(GlobalVar {
            name,
            value_id,
            init,
        });
        Ok(())
    }

    fn parse_type(&mut self) -> Result<TypeId, ParseError> {
        let line = self.line();
        match self.next()? {
            Token::Word(w) if w == "ptr" => Ok(self.module.types.intern(Type::Ptr)),
            Token::Word(w) if w.starts_with('i') => {
                let bits = w[1..]
                    .parse::<u32>()
                    .map_err(|_| ParseError::UnknownType { line, name: w })?;
                Ok(self.module.types.intern(Type::Int { bits }))
            }
            Token::LBracket => {
                let len = match self.next()? {
                    Token::Int(i) if i >= 0 => i as u64,
                    other => return Err(self.expected("array length", &other)),
                };
                self.expect_word("x")?;
                let elem = self.parse_type()?;
                self.expect(Token::RBracket)?;
                Ok(self.module.types.intern(Type::Array { elem, len }))
            }
            Token::LBrace => {
                let mut fields = Vec::new();
                loop {
                    fields.push(self.parse_type()?);
                    if !self.eat_comma() {
                        break;
                    }
                }
                self.expect(Token::RBrace)?;
                Ok(self.module.types.intern(Type::Struct { fields }))
            }
            other => Err(self.expected("type", &other)),
        }
    }

    fn parse_raw_value(&mut self) -> Result<RawVal, ParseError> {
        match self.next()? {
            Token::Int(i) => Ok(RawVal::Int(i)),
            Token::Local(n) => Ok(RawVal::Local(n)),
            Token::Global(n) => Ok(RawVal::Global(n)),
            Token::Word(w) if w == "true" => Ok(RawVal::Int(1)),
            Token::Word(w) if w == "false" => Ok(RawVal::Int(0)),
            Token::Word(w) if w == "null" => Ok(RawVal::Int(0)),
            other => Err(self.expected("value", &other)),
        }
    }

    /// `<ty> <val>` pair; the type is parsed and dropped.
    fn parse_typed_value(&mut self) -> Result<RawVal, ParseError> {
        self.parse_type()?;
        self.skip_attrs();
        self.parse_raw_value()
    }

    fn parse_label_ref(&mut self) -> Result<String, ParseError> {
        self.expect_word("label")?;
        match self.next()? {
            Token::Local(n) => Ok(n),
            other => Err(self.expected("%label", &other)),
        }
    }

    fn parse_declare(&mut self) -> Result<(), ParseError> {
        self.skip_attrs();
        self.parse_type()?;
        self.skip_attrs();
        let name = match self.next()? {
            Token::Global(n) => n,
            other => return Err(self.expected("@name", &other)),
        };
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        while self.peek() != Some(&Token::RParen) {
            self.parse_type()?;
            self.skip_attrs();
            if let Some(Token::Local(_)) = self.peek() {
                self.pos += 1;
            }
            params.push(self.fresh_value());
            if !self.eat_comma() {
                break;
            }
        }
        self.expect(Token::RParen)?;
        self.module.funcs.push(Func {
            name,
            params,
            blocks: Vec::new(),
        });
        Ok(())
    }

    fn parse_define(&mut self) -> Result<(), ParseError> {
        self.skip_attrs();
        self.parse_type()?;
        self.skip_attrs();
        let name = match self.next()? {
            Token::Global(n) => n,
            other => return Err(self.expected("@name", &other)),
        };
        self.expect(Token::LParen)?;
        let mut param_names = Vec::new();
        while self.peek() != Some(&Token::RParen) {
            self.parse_type()?;
            self.skip_attrs();
            match self.next()? {
                Token::Local(n) => param_names.push(n),
                other => return Err(self.expected("%param", &other)),
            }
            if !self.eat_comma() {
                break;
            }
        }
        self.expect(Token::RParen)?;
        self.skip_attrs();
        self.expect(Token::LBrace)?;

        let mut blocks: Vec<RawBlock> = Vec::new();
        loop {
            match self.peek().ok_or(ParseError::Eof)? {
                Token::RBrace => {
                    self.pos += 1;
                    break;
                }
                Token::Word(_) if self.peek2() == Some(&Token::Colon) => {
                    let label = match self.next()? {
                        Token::Word(w) => w,
                        _ => unreachable!("peeked a word"),
                    };
                    self.expect(Token::Colon)?;
                    blocks.push(RawBlock {
                        label,
                        instrs: Vec::new(),
                    });
                }
                _ => {
                    if blocks.is_empty() {
                        blocks.push(RawBlock {
                            label: "entry".to_string(),
                            instrs: Vec::new(),
                        });
                    }
                    let instr = self.parse_instr()?;
                    blocks
                        .last_mut()
                        .expect("a block was just ensured")
                        .instrs
                        .push(instr);
                }
            }
        }

        let func = self.resolve_function(name, param_names, blocks)?;
        self.module.funcs.push(func);
        Ok(())
    }

    fn parse_instr(&mut self) -> Result<RawInstr, ParseError> {
        let line = self.line();
        let result = if let Some(Token::Local(_)) = self.peek() {
            let name = match self.next()? {
                Token::Local(n) => n,
                _ => unreachable!("peeked a local"),
            };
            self.expect(Token::Equals)?;
            Some(name)
        } else {
            None
        };

        let mnemonic = match self.next()? {
            Token::Word(w) => w,
            other => return Err(self.expected("instruction", &other)),
        };
        self.skip_attrs();

        let bin_op = |m: &str| -> Option<BinOp> {
            Some(match m {
                "add" => BinOp::Add,
                "sub" => BinOp::Sub,
                "mul" => BinOp::Mul,
                "sdiv" => BinOp::SDiv,
                "srem" => BinOp::SRem,
                "and" => BinOp::And,
                "or" => BinOp::Or,
                "xor" => BinOp::Xor,
                "shl" => BinOp::Shl,
                "ashr" => BinOp::AShr,
                _ => return None,
            })
        };

        let op = if let Some(op) = bin_op(&mnemonic) {
            self.parse_type()?;
            let lhs = self.parse_raw_value()?;
            self.expect(Token::Comma)?;
            let rhs = self.parse_raw_value()?;
            RawOp::Bin { op, lhs, rhs }
        } else {
            match mnemonic.as_str() {
                "icmp" => {
                    let pred = match self.next()? {
                        Token::Word(p) => match p.as_str() {
                            "eq" => Pred::Eq,
                            "ne" => Pred::Ne,
                            "slt" => Pred::Slt,
                            "sle" => Pred::Sle,
                            "sgt" => Pred::Sgt,
                            "sge" => Pred::Sge,
                            _ => return Err(ParseError::UnknownInstr { line, name: p }),
                        },
                        other => return Err(self.expected("predicate", &other)),
                    };
                    self.parse_type()?;
                    let lhs = self.parse_raw_value()?;
                    self.expect(Token::Comma)?;
                    let rhs = self.parse_raw_value()?;
                    RawOp::Icmp { pred, lhs, rhs }
                }
                "alloca" => {
                    let ty = self.parse_type()?;
                    if self.eat_comma() {
                        self.expect_word("align")?;
                        self.next()?;
                    }
                    RawOp::Alloca { ty }
                }
                "load" => {
                    self.parse_type()?;
                    self.expect(Token::Comma)?;
                    let ptr = self.parse_typed_value()?;
                    RawOp::Load { ptr }
                }
                "store" => {
                    let value = self.parse_typed_value()?;
                    self.expect(Token::Comma)?;
                    let ptr = self.parse_typed_value()?;
                    RawOp::Store { value, ptr }
                }
                "getelementptr" => {
                    self.skip_attrs();
                    let source_ty = self.parse_type()?;
                    self.expect(Token::Comma)?;
                    let base = self.parse_typed_value()?;
                    let mut indices = Vec::new();
                    while self.eat_comma() {
                        indices.push(self.parse_typed_value()?);
                    }
                    RawOp::Gep {
                        source_ty,
                        base,
                        indices,
                    }
                }
                "phi" => {
                    self.parse_type()?;
                    let mut incoming = Vec::new();
                    loop {
                        self.expect(Token::LBracket)?;
                        let value = self.parse_raw_value()?;
                        self.expect(Token::Comma)?;
                        let label = match self.next()? {
                            Token::Local(n) => n,
                            other => return Err(self.expected("%label", &other)),
                        };
                        self.expect(Token::RBracket)?;
                        incoming.push((value, label));
                        if !self.eat_comma() {
                            break;
                        }
                    }
                    RawOp::Phi { incoming }
                }
                "sext" => {
                    self.parse_type()?;
                    let value = self.parse_raw_value()?;
                    self.expect_word("to")?;
                    self.parse_type()?;
                    RawOp::Sext { value }
                }
                "call" => {
                    self.parse_type()?;
                    let callee = match self.next()? {
                        Token::Global(n) => n,
                        other => return Err(self.expected("@callee", &other)),
                    };
                    self.expect(Token::LParen)?;
                    let mut args = Vec::new();
                    while self.peek() != Some(&Token::RParen) {
                        args.push(self.parse_typed_value()?);
                        if !self.eat_comma() {
                            break;
                        }
                    }
                    self.expect(Token::RParen)?;
                    RawOp::Call { callee, args }
                }
                "ret" => {
                    if let Some(Token::Word(w)) = self.peek() {
                        if w == "void" {
                            self.pos += 1;
                            RawOp::Ret { value: None }
                        } else {
                            self.parse_type()?;
                            let value = self.parse_raw_value()?;
                            RawOp::Ret { value: Some(value) }
                        }
                    } else {
                        RawOp::Ret { value: None }
                    }
                }
                "br" => {
                    if self.peek() == Some(&Token::Word("label".to_string())) {
                        let dest = self.parse_label_ref()?;
                        RawOp::Br { dest }
                    } else {
                        self.parse_type()?;
                        let cond = self.parse_raw_value()?;
                        self.expect(Token::Comma)?;
                        let then_dest = self.parse_label_ref()?;
                        self.expect(Token::Comma)?;
                        let else_dest = self.parse_label_ref()?;
                        RawOp::CondBr {
                            cond,
                            then_dest,
                            else_dest,
                        }
                    }
                }
                name => return Err(ParseError::UnknownInstr { line, name: name.to_string() }),
            }
        };

        Ok(RawInstr { result, op })
    }

    fn resolve_function(
        &mut self,
        name: String,
        param_names: Vec<String>,
        raw_blocks: Vec<RawBlock>,
    ) -> Result<Func, ParseError> {
        let mut value_names: HashMap<String, ValueId> = HashMap::new();
        let mut params = Vec::new();
        for pname in param_names {
            let id = self.fresh_value();
            value_names.insert(pname, id);
            params.push(id);
        }

        let mut labels: HashMap<String, u32> = HashMap::new();
        for (index, block) in raw_blocks.iter().enumerate() {
            labels.insert(block.label.clone(), index as u32);
        }

        // Results first: operands may reference values defined later
        // (phis over back-edges).
        let mut result_ids: Vec<Vec<ValueId>> = Vec::new();
        for block in &raw_blocks {
            let mut ids = Vec::new();
            for instr in &block.instrs {
                let id = self.fresh_value();
                if let Some(result) = &instr.result {
                    value_names.insert(result.clone(), id);
                }
                ids.push(id);
            }
            result_ids.push(ids);
        }

        let resolve_value = |parser: &Self, raw: &RawVal| -> Result<Value, ParseError> {
            match raw {
                RawVal::Int(i) => Ok(Value::Const(*i)),
                RawVal::Local(n) => value_names
                    .get(n)
                    .map(|id| Value::Ref(*id))
                    .ok_or_else(|| ParseError::UndefinedValue(n.clone())),
                RawVal::Global(n) => parser
                    .global_names
                    .get(n)
                    .map(|id| Value::Ref(*id))
                    .ok_or_else(|| ParseError::UndefinedGlobal(n.clone())),
            }
        };
        let resolve_label = |label: &String| -> Result<u32, ParseError> {
            labels
                .get(label)
                .copied()
                .ok_or_else(|| ParseError::UndefinedLabel(label.clone()))
        };

        let mut blocks = Vec::new();
        for (block_index, block) in raw_blocks.into_iter().enumerate() {
            let mut instrs = Vec::new();
            for (instr_index, raw) in block.instrs.into_iter().enumerate() {
                let op = match raw.op {
                    RawOp::Bin { op, lhs, rhs } => Op::Bin {
                        op,
                        lhs: resolve_value(self, &lhs)?,
                        rhs: resolve_value(self, &rhs)?,
                    },
                    RawOp::Icmp { pred, lhs, rhs } => Op::Icmp {
                        pred,
                        lhs: resolve_value(self, &lhs)?,
                        rhs: resolve_value(self, &rhs)?,
                    },
                    RawOp::Alloca { ty } => Op::Alloca { ty },
                    RawOp::Load { ptr } => Op::Load {
                        ptr: resolve_value(self, &ptr)?,
                    },
                    RawOp::Store { value, ptr } => Op::Store {
                        value: resolve_value(self, &value)?,
                        ptr: resolve_value(self, &ptr)?,
                    },
                    RawOp::Gep {
                        source_ty,
                        base,
                        indices,
                    } => Op::Gep {
                        source_ty,
                        base: resolve_value(self, &base)?,
                        indices: indices
                            .iter()
                            .map(|i| resolve_value(self, i))
                            .collect::<Result<_, _>>()?,
                    },
                    RawOp::Phi { incoming } => Op::Phi {
                        incoming: incoming
                            .iter()
                            .map(|(v, l)| Ok((resolve_value(self, v)?, resolve_label(l)?)))
                            .collect::<Result<_, ParseError>>()?,
                    },
                    RawOp::Sext { value } => Op::Sext {
                        value: resolve_value(self, &value)?,
                    },
                    RawOp::Call { callee, args } => Op::Call {
                        callee: self
                            .func_names
                            .get(&callee)
                            .copied()
                            .ok_or(ParseError::UndefinedFunction(callee))?,
                        args: args
                            .iter()
                            .map(|a| resolve_value(self, a))
                            .collect::<Result<_, _>>()?,
                    },
                    RawOp::Ret { value } => Op::Ret {
                        value: value.map(|v| resolve_value(self, &v)).transpose()?,
                    },
                    RawOp::Br { dest } => Op::Br {
                        dest: resolve_label(&dest)?,
                    },
                    RawOp::CondBr {
                        cond,
                        then_dest,
                        else_dest,
                    } => Op::CondBr {
                        cond: resolve_value(self, &cond)?,
                        then_dest: resolve_label(&then_dest)?,
                        else_dest: resolve_label(&else_dest)?,
                    },
                };
                instrs.push(Instr {
                    result: result_ids[block_index][instr_index],
                    op,
                });
            }
            blocks.push(Block {
                label: block.label,
                instrs,
            });
        }

        Ok(Func {
            name,
            params,
            blocks,
        })
    }
}
