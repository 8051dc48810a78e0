//! Parsing and a shared AST walk for submitted commands.
//!
//! The validator and the resolver both need the same facts about a command:
//! which identifiers it references, which static member chains it reads
//! (`a.b.c`, `a["b"]`), which calls it makes and in what context, and which
//! names it declares. [`walk`] visits the tree once and reports those facts
//! to a [`Visitor`].

use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_parser::{ParseOptions, Parser};
use oxc_span::{SourceType, Span};

/// Maximum bracket nesting accepted before parsing.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Recursion limit of the walk itself. Long operator chains nest in the
/// tree without nesting brackets.
const MAX_WALK_DEPTH: usize = 2048;

/// A parse failure with its 1-based line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    /// 1-based line of the first error.
    pub line: usize,
    /// Parser message.
    pub message: String,
}

/// Parse a command as a module body that may `return` at top level.
pub fn parse<'a>(allocator: &'a Allocator, source: &'a str) -> Result<Program<'a>, SyntaxIssue> {
    let options = ParseOptions {
        allow_return_outside_function: true,
        ..ParseOptions::default()
    };
    let ret = Parser::new(allocator, source, SourceType::mjs())
        .with_options(options)
        .parse();

    if ret.panicked && ret.errors.is_empty() {
        return Err(SyntaxIssue {
            line: 1,
            message: "parser could not recover from malformed input".into(),
        });
    }
    if let Some(err) = ret.errors.first() {
        let offset = err
            .labels
            .as_ref()
            .and_then(|labels| labels.first())
            .map(|label| label.offset())
            .unwrap_or(0);
        return Err(SyntaxIssue {
            line: line_of(source, offset),
            message: err.message.to_string(),
        });
    }
    Ok(ret.program)
}

/// 1-based line of a byte offset.
pub fn line_of(source: &str, offset: usize) -> usize {
    let end = offset.min(source.len());
    source.as_bytes()[..end].iter().filter(|&&b| b == b'\n').count() + 1
}

/// Deepest bracket nesting in the source, counted without parsing.
///
/// Brackets inside string literals, template text and comments do not
/// count.
pub fn nesting_depth(source: &str) -> usize {
    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Code,
        Quoted(char),
        LineComment,
        BlockComment,
    }

    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    let mut mode = Mode::Code;
    let mut chars = source.chars().peekable();
    while let Some(ch) = chars.next() {
        match mode {
            Mode::Quoted(quote) => match ch {
                '\\' => {
                    chars.next();
                }
                c if c == quote => mode = Mode::Code,
                '\n' if quote != '`' => mode = Mode::Code,
                _ => {}
            },
            Mode::LineComment => {
                if ch == '\n' {
                    mode = Mode::Code;
                }
            }
            Mode::BlockComment => {
                if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    mode = Mode::Code;
                }
            }
            Mode::Code => match ch {
                '"' | '\'' | '`' => mode = Mode::Quoted(ch),
                '/' if chars.peek() == Some(&'/') => mode = Mode::LineComment,
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    mode = Mode::BlockComment;
                }
                '{' | '[' | '(' => {
                    depth += 1;
                    max_depth = max_depth.max(depth);
                }
                '}' | ']' | ')' => depth = depth.saturating_sub(1),
                _ => {}
            },
        }
    }
    max_depth
}

/// Where in the tree a node was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ctx {
    /// Walk depth of the node. Nested nodes always have a larger value.
    pub depth: usize,
    /// Number of enclosing function bodies.
    pub function_depth: usize,
    /// Whether `await` is legal here. The top level counts as async.
    pub in_async: bool,
    /// Whether the node is the direct operand of `await`.
    pub awaited: bool,
}

impl Ctx {
    fn top() -> Self {
        Self {
            depth: 0,
            function_depth: 0,
            in_async: true,
            awaited: false,
        }
    }

    fn plain(self) -> Self {
        Self {
            awaited: false,
            ..self
        }
    }

    fn function(self, is_async: bool) -> Self {
        Self {
            function_depth: self.function_depth + 1,
            in_async: is_async,
            awaited: false,
            ..self
        }
    }
}

/// Receives the facts found by [`walk`]. Every method defaults to a no-op.
pub trait Visitor<'a> {
    /// An identifier read, including the root of every member chain.
    fn reference(&mut self, _ident: &IdentifierReference<'a>, _ctx: Ctx) {}

    /// The longest static member chain rooted at an identifier, e.g.
    /// `["Deno", "run"]` for `Deno.run(...)` or `Deno["run"]`.
    fn chain(&mut self, _segments: &[&'a str], _span: Span, _ctx: Ctx) {}

    /// A call expression, reported before its callee and arguments.
    fn call(&mut self, _call: &CallExpression<'a>, _ctx: Ctx) {}

    /// An `import(...)` expression.
    fn dynamic_import(&mut self, _span: Span) {}

    /// An `import ... from` declaration.
    fn static_import(&mut self, _span: Span) {}

    /// A declared name: variables, functions, classes, parameters and
    /// catch bindings.
    fn binding(&mut self, _name: &'a str) {}
}

/// Result of a complete walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkSummary {
    /// The walk stopped descending somewhere because the tree was too deep.
    pub truncated: bool,
}

/// Visit every statement of `program`.
pub fn walk<'a, V: Visitor<'a>>(program: &Program<'a>, visitor: &mut V) -> WalkSummary {
    let mut walker = Walker {
        visitor,
        truncated: false,
    };
    walker.statements(&program.body, Ctx::top());
    WalkSummary {
        truncated: walker.truncated,
    }
}

/// The static member chain of an expression, if it is one.
///
/// Computed members with a string-literal key count as static.
pub fn static_chain<'a>(expr: &Expression<'a>) -> Option<Vec<&'a str>> {
    match expr {
        Expression::Identifier(ident) => Some(vec![ident.name.as_str()]),
        Expression::StaticMemberExpression(member) => {
            let mut chain = static_chain(&member.object)?;
            chain.push(member.property.name.as_str());
            Some(chain)
        }
        Expression::ComputedMemberExpression(member) => match &member.expression {
            Expression::StringLiteral(lit) => {
                let mut chain = static_chain(&member.object)?;
                chain.push(lit.value.as_str());
                Some(chain)
            }
            _ => None,
        },
        _ => None,
    }
}

/// The identifier at the root of a static member chain.
pub fn chain_root<'b, 'a>(expr: &'b Expression<'a>) -> Option<&'b IdentifierReference<'a>> {
    match expr {
        Expression::Identifier(ident) => Some(ident),
        Expression::StaticMemberExpression(member) => chain_root(&member.object),
        Expression::ComputedMemberExpression(member) => chain_root(&member.object),
        _ => None,
    }
}

struct Walker<'v, V> {
    visitor: &'v mut V,
    truncated: bool,
}

impl<'a, V: Visitor<'a>> Walker<'_, V> {
    fn descend(&mut self, ctx: Ctx) -> Option<Ctx> {
        if ctx.depth >= MAX_WALK_DEPTH {
            self.truncated = true;
            return None;
        }
        Some(Ctx {
            depth: ctx.depth + 1,
            ..ctx
        })
    }

    fn statements(&mut self, stmts: &[Statement<'a>], ctx: Ctx) {
        for stmt in stmts {
            self.statement(stmt, ctx);
        }
    }

    fn statement(&mut self, stmt: &Statement<'a>, ctx: Ctx) {
        let Some(ctx) = self.descend(ctx.plain()) else {
            return;
        };
        match stmt {
            Statement::ExpressionStatement(es) => self.expr(&es.expression, ctx),
            Statement::BlockStatement(block) => self.statements(&block.body, ctx),
            Statement::IfStatement(ifs) => {
                self.expr(&ifs.test, ctx);
                self.statement(&ifs.consequent, ctx);
                if let Some(alt) = &ifs.alternate {
                    self.statement(alt, ctx);
                }
            }
            Statement::ReturnStatement(ret) => {
                if let Some(arg) = &ret.argument {
                    self.expr(arg, ctx);
                }
            }
            Statement::VariableDeclaration(decl) => self.variable_declaration(decl, ctx),
            Statement::ForStatement(fors) => {
                match &fors.init {
                    Some(ForStatementInit::VariableDeclaration(decl)) => {
                        self.variable_declaration(decl, ctx)
                    }
                    Some(init) => {
                        if let Some(expr) = init.as_expression() {
                            self.expr(expr, ctx);
                        }
                    }
                    None => {}
                }
                if let Some(test) = &fors.test {
                    self.expr(test, ctx);
                }
                if let Some(update) = &fors.update {
                    self.expr(update, ctx);
                }
                self.statement(&fors.body, ctx);
            }
            Statement::ForInStatement(fis) => {
                self.for_left(&fis.left, ctx);
                self.expr(&fis.right, ctx);
                self.statement(&fis.body, ctx);
            }
            Statement::ForOfStatement(fos) => {
                self.for_left(&fos.left, ctx);
                self.expr(&fos.right, ctx);
                self.statement(&fos.body, ctx);
            }
            Statement::WhileStatement(ws) => {
                self.expr(&ws.test, ctx);
                self.statement(&ws.body, ctx);
            }
            Statement::DoWhileStatement(dws) => {
                self.statement(&dws.body, ctx);
                self.expr(&dws.test, ctx);
            }
            Statement::SwitchStatement(ss) => {
                self.expr(&ss.discriminant, ctx);
                for case in &ss.cases {
                    if let Some(test) = &case.test {
                        self.expr(test, ctx);
                    }
                    self.statements(&case.consequent, ctx);
                }
            }
            Statement::TryStatement(ts) => {
                self.statements(&ts.block.body, ctx);
                if let Some(handler) = &ts.handler {
                    if let Some(param) = &handler.param {
                        self.binding_pattern(&param.pattern, ctx);
                    }
                    self.statements(&handler.body.body, ctx);
                }
                if let Some(finalizer) = &ts.finalizer {
                    self.statements(&finalizer.body, ctx);
                }
            }
            Statement::ThrowStatement(ts) => self.expr(&ts.argument, ctx),
            Statement::LabeledStatement(ls) => self.statement(&ls.body, ctx),
            Statement::WithStatement(ws) => {
                self.expr(&ws.object, ctx);
                self.statement(&ws.body, ctx);
            }
            Statement::FunctionDeclaration(func) => self.function(func, ctx),
            Statement::ClassDeclaration(class) => self.class(class, ctx),
            Statement::ImportDeclaration(decl) => self.visitor.static_import(decl.span),
            _ => {}
        }
    }

    fn variable_declaration(&mut self, decl: &VariableDeclaration<'a>, ctx: Ctx) {
        for declarator in &decl.declarations {
            self.binding_pattern(&declarator.id, ctx);
            if let Some(init) = &declarator.init {
                self.expr(init, ctx);
            }
        }
    }

    fn for_left(&mut self, left: &ForStatementLeft<'a>, ctx: Ctx) {
        if let ForStatementLeft::VariableDeclaration(decl) = left {
            self.variable_declaration(decl, ctx);
        }
    }

    fn binding_pattern(&mut self, pattern: &BindingPattern<'a>, ctx: Ctx) {
        let Some(ctx) = self.descend(ctx) else {
            return;
        };
        match &pattern.kind {
            BindingPatternKind::BindingIdentifier(ident) => {
                self.visitor.binding(ident.name.as_str());
            }
            BindingPatternKind::ObjectPattern(obj) => {
                for prop in &obj.properties {
                    if prop.computed {
                        if let Some(key) = prop.key.as_expression() {
                            self.expr(key, ctx);
                        }
                    }
                    self.binding_pattern(&prop.value, ctx);
                }
                if let Some(rest) = &obj.rest {
                    self.binding_pattern(&rest.argument, ctx);
                }
            }
            BindingPatternKind::ArrayPattern(arr) => {
                for element in arr.elements.iter().flatten() {
                    self.binding_pattern(element, ctx);
                }
                if let Some(rest) = &arr.rest {
                    self.binding_pattern(&rest.argument, ctx);
                }
            }
            BindingPatternKind::AssignmentPattern(assign) => {
                self.binding_pattern(&assign.left, ctx);
                self.expr(&assign.right, ctx);
            }
        }
    }

    fn params(&mut self, params: &FormalParameters<'a>, ctx: Ctx) {
        for param in &params.items {
            self.binding_pattern(&param.pattern, ctx);
        }
        if let Some(rest) = &params.rest {
            self.binding_pattern(&rest.argument, ctx);
        }
    }

    fn function(&mut self, func: &Function<'a>, ctx: Ctx) {
        if let Some(id) = &func.id {
            self.visitor.binding(id.name.as_str());
        }
        let inner = ctx.function(func.r#async);
        self.params(&func.params, inner);
        if let Some(body) = &func.body {
            self.statements(&body.statements, inner);
        }
    }

    fn class(&mut self, class: &Class<'a>, ctx: Ctx) {
        if let Some(id) = &class.id {
            self.visitor.binding(id.name.as_str());
        }
        if let Some(super_class) = &class.super_class {
            self.expr(super_class, ctx);
        }
        for element in &class.body.body {
            match element {
                ClassElement::MethodDefinition(md) => {
                    self.property_key(&md.key, md.computed, ctx);
                    self.function(&md.value, ctx);
                }
                ClassElement::PropertyDefinition(pd) => {
                    self.property_key(&pd.key, pd.computed, ctx);
                    if let Some(value) = &pd.value {
                        self.expr(value, ctx.function(false));
                    }
                }
                ClassElement::AccessorProperty(ap) => {
                    self.property_key(&ap.key, ap.computed, ctx);
                    if let Some(value) = &ap.value {
                        self.expr(value, ctx.function(false));
                    }
                }
                ClassElement::StaticBlock(block) => {
                    self.statements(&block.body, ctx.function(false));
                }
                _ => {}
            }
        }
    }

    fn property_key(&mut self, key: &PropertyKey<'a>, computed: bool, ctx: Ctx) {
        if computed {
            if let Some(expr) = key.as_expression() {
                self.expr(expr, ctx);
            }
        }
    }

    fn arguments(&mut self, args: &[Argument<'a>], ctx: Ctx) {
        for arg in args {
            match arg {
                Argument::SpreadElement(spread) => self.expr(&spread.argument, ctx),
                other => {
                    if let Some(expr) = other.as_expression() {
                        self.expr(expr, ctx);
                    }
                }
            }
        }
    }

    fn member(&mut self, member: &MemberExpression<'a>, ctx: Ctx) {
        match member {
            MemberExpression::StaticMemberExpression(m) => {
                self.member_tail(&m.object, Some(m.property.name.as_str()), m.span, ctx)
            }
            MemberExpression::ComputedMemberExpression(m) => match &m.expression {
                Expression::StringLiteral(lit) => {
                    self.member_tail(&m.object, Some(lit.value.as_str()), m.span, ctx)
                }
                other => {
                    self.member_tail(&m.object, None, m.span, ctx);
                    self.expr(other, ctx);
                }
            },
            MemberExpression::PrivateFieldExpression(m) => self.expr(&m.object, ctx),
        }
    }

    /// Report `object.property` as a chain, or walk `object` when the chain
    /// is broken by a dynamic part.
    fn member_tail(&mut self, object: &Expression<'a>, property: Option<&'a str>, span: Span, ctx: Ctx) {
        if let (Some(property), Some(mut segments), Some(root)) =
            (property, static_chain(object), chain_root(object))
        {
            segments.push(property);
            self.visitor.reference(root, ctx);
            self.visitor.chain(&segments, span, ctx);
            return;
        }
        self.expr(object, ctx);
    }

    fn call(&mut self, call: &CallExpression<'a>, ctx: Ctx) {
        self.visitor.call(call, ctx);
        let inner = ctx.plain();
        self.expr(&call.callee, inner);
        self.arguments(&call.arguments, inner);
    }

    fn expr(&mut self, expr: &Expression<'a>, ctx: Ctx) {
        let awaited = ctx.awaited;
        let Some(ctx) = self.descend(ctx.plain()) else {
            return;
        };
        match expr {
            Expression::Identifier(ident) => self.visitor.reference(ident, ctx),
            Expression::StaticMemberExpression(m) => {
                self.member_tail(&m.object, Some(m.property.name.as_str()), m.span, ctx)
            }
            Expression::ComputedMemberExpression(m) => match &m.expression {
                Expression::StringLiteral(lit) => {
                    self.member_tail(&m.object, Some(lit.value.as_str()), m.span, ctx)
                }
                other => {
                    self.member_tail(&m.object, None, m.span, ctx);
                    self.expr(other, ctx);
                }
            },
            Expression::PrivateFieldExpression(m) => self.expr(&m.object, ctx),
            Expression::CallExpression(call) => self.call(call, Ctx { awaited, ..ctx }),
            Expression::NewExpression(new_expr) => {
                self.expr(&new_expr.callee, ctx);
                self.arguments(&new_expr.arguments, ctx);
            }
            Expression::ImportExpression(import) => {
                self.visitor.dynamic_import(import.span);
                self.expr(&import.source, ctx);
            }
            Expression::ChainExpression(chain) => match &chain.expression {
                ChainElement::CallExpression(call) => self.call(call, Ctx { awaited, ..ctx }),
                ChainElement::StaticMemberExpression(m) => {
                    self.member_tail(&m.object, Some(m.property.name.as_str()), m.span, ctx)
                }
                ChainElement::ComputedMemberExpression(m) => match &m.expression {
                    Expression::StringLiteral(lit) => {
                        self.member_tail(&m.object, Some(lit.value.as_str()), m.span, ctx)
                    }
                    other => {
                        self.member_tail(&m.object, None, m.span, ctx);
                        self.expr(other, ctx);
                    }
                },
                ChainElement::PrivateFieldExpression(member) => self.expr(&member.object, ctx),
                _ => {}
            },
            Expression::TaggedTemplateExpression(tagged) => {
                self.expr(&tagged.tag, ctx);
                for e in &tagged.quasi.expressions {
                    self.expr(e, ctx);
                }
            }
            Expression::TemplateLiteral(tl) => {
                for e in &tl.expressions {
                    self.expr(e, ctx);
                }
            }
            Expression::ArrowFunctionExpression(arrow) => {
                let inner = ctx.function(arrow.r#async);
                self.params(&arrow.params, inner);
                self.statements(&arrow.body.statements, inner);
            }
            Expression::FunctionExpression(func) => self.function(func, ctx),
            Expression::ClassExpression(class) => self.class(class, ctx),
            Expression::AssignmentExpression(assign) => {
                if let Some(member) = assign.left.as_member_expression() {
                    self.member(member, ctx);
                }
                self.expr(&assign.right, ctx);
            }
            Expression::BinaryExpression(bin) => {
                self.expr(&bin.left, ctx);
                self.expr(&bin.right, ctx);
            }
            Expression::LogicalExpression(log) => {
                self.expr(&log.left, ctx);
                self.expr(&log.right, ctx);
            }
            Expression::ConditionalExpression(cond) => {
                self.expr(&cond.test, ctx);
                self.expr(&cond.consequent, ctx);
                self.expr(&cond.alternate, ctx);
            }
            Expression::UnaryExpression(unary) => self.expr(&unary.argument, ctx),
            Expression::SequenceExpression(seq) => {
                for e in &seq.expressions {
                    self.expr(e, ctx);
                }
            }
            Expression::ArrayExpression(arr) => {
                for element in &arr.elements {
                    match element {
                        ArrayExpressionElement::SpreadElement(spread) => {
                            self.expr(&spread.argument, ctx)
                        }
                        ArrayExpressionElement::Elision(_) => {}
                        other => {
                            if let Some(e) = other.as_expression() {
                                self.expr(e, ctx);
                            }
                        }
                    }
                }
            }
            Expression::ObjectExpression(obj) => {
                for prop in &obj.properties {
                    match prop {
                        ObjectPropertyKind::ObjectProperty(p) => {
                            self.property_key(&p.key, p.computed, ctx);
                            self.expr(&p.value, ctx);
                        }
                        ObjectPropertyKind::SpreadProperty(spread) => {
                            self.expr(&spread.argument, ctx)
                        }
                    }
                }
            }
            Expression::AwaitExpression(aw) => {
                self.expr(&aw.argument, Ctx { awaited: true, ..ctx })
            }
            Expression::YieldExpression(y) => {
                if let Some(arg) = &y.argument {
                    self.expr(arg, ctx);
                }
            }
            Expression::ParenthesizedExpression(paren) => {
                self.expr(&paren.expression, Ctx { awaited, ..ctx })
            }
            _ => {}
        }
    }
}
