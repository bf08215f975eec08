//! Lowering from the oxc AST into [`Expr`].

use std::rc::Rc;

use oxc_allocator::Allocator;
use oxc_ast::ast::{
    self, ArrayExpressionElement, AssignmentTarget, BindingPattern, ChainElement, Expression,
    ObjectPropertyKind, PropertyKey, SimpleAssignmentTarget, Statement as OxcStatement,
};
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType, Span};
use regex::Regex;

use super::ast::*;
use crate::error::CompileError;
use crate::value::{format_number, Value};

const CONSTRUCTORS: &[&str] = &["Map", "Set", "Date", "Error", "RegExp", "Array", "Object"];

/// Parse and lower a single expression.
pub fn parse_expression(source: &str) -> Result<Expr, CompileError> {
    let allocator = Allocator::default();
    let source_type = SourceType::default().with_module(true);
    let ret = Parser::new(&allocator, source, source_type).parse_expression();

    match ret {
        Ok(expr) => Lowerer { source }.expression(&expr),
        Err(error) => Err(CompileError::Syntax {
            expression: source.to_string(),
            message: format!("Invalid expression syntax: {:?}", error),
        }),
    }
}

struct Lowerer<'s> {
    source: &'s str,
}

impl<'s> Lowerer<'s> {
    fn unsupported(&self, span: Span) -> CompileError {
        let snippet = self
            .source
            .get(span.start as usize..span.end as usize)
            .unwrap_or(self.source);
        CompileError::unsupported(self.source, snippet)
    }

    fn expression(&self, expr: &Expression<'_>) -> Result<Expr, CompileError> {
        Ok(match expr {
            Expression::NumericLiteral(n) => Expr::Literal(Value::Number(n.value)),
            Expression::StringLiteral(s) => Expr::Literal(Value::string(s.value.as_str())),
            Expression::BooleanLiteral(b) => Expr::Literal(Value::Bool(b.value)),
            Expression::NullLiteral(_) => Expr::Literal(Value::Null),
            Expression::RegExpLiteral(r) => self.regex_literal(r.span)?,
            Expression::Identifier(id) => match id.name.as_str() {
                "undefined" => Expr::Literal(Value::Undefined),
                "NaN" => Expr::Literal(Value::Number(f64::NAN)),
                "Infinity" => Expr::Literal(Value::Number(f64::INFINITY)),
                name => Expr::Identifier(name.to_string()),
            },
            Expression::TemplateLiteral(tpl) => {
                let quasis = tpl
                    .quasis
                    .iter()
                    .map(|q| match &q.value.cooked {
                        Some(cooked) => cooked.to_string(),
                        None => q.value.raw.to_string(),
                    })
                    .collect();
                let mut expressions = Vec::new();
                for e in &tpl.expressions {
                    expressions.push(self.expression(e)?);
                }
                Expr::Template {
                    quasis,
                    expressions,
                }
            }
            Expression::ArrayExpression(arr) => {
                let mut elements = Vec::new();
                for elem in &arr.elements {
                    elements.push(match elem {
                        ArrayExpressionElement::SpreadElement(s) => {
                            Element::Spread(self.expression(&s.argument)?)
                        }
                        ArrayExpressionElement::Elision(_) => Element::Hole,
                        other => match other.as_expression() {
                            Some(e) => Element::Item(self.expression(e)?),
                            None => return Err(self.unsupported(arr.span)),
                        },
                    });
                }
                Expr::Array(elements)
            }
            Expression::ObjectExpression(obj) => {
                let mut properties = Vec::new();
                for prop in &obj.properties {
                    properties.push(match prop {
                        ObjectPropertyKind::ObjectProperty(p) => {
                            let key = if p.computed {
                                match p.key.as_expression() {
                                    Some(e) => PropertyName::Computed(self.expression(e)?),
                                    None => return Err(self.unsupported(p.span)),
                                }
                            } else {
                                PropertyName::Static(self.property_key(&p.key, p.span)?)
                            };
                            Property::Entry {
                                key,
                                value: self.expression(&p.value)?,
                            }
                        }
                        ObjectPropertyKind::SpreadProperty(s) => {
                            Property::Spread(self.expression(&s.argument)?)
                        }
                    });
                }
                Expr::Object(properties)
            }
            Expression::StaticMemberExpression(m) => self.static_member(m)?,
            Expression::ComputedMemberExpression(m) => self.computed_member(m)?,
            Expression::CallExpression(call) => self.call(call)?,
            Expression::ChainExpression(chain) => match &chain.expression {
                ChainElement::CallExpression(call) => self.call(call)?,
                ChainElement::StaticMemberExpression(m) => self.static_member(m)?,
                ChainElement::ComputedMemberExpression(m) => self.computed_member(m)?,
                _ => return Err(self.unsupported(chain.span)),
            },
            Expression::NewExpression(new_expr) => match &new_expr.callee {
                Expression::Identifier(id) if CONSTRUCTORS.contains(&id.name.as_str()) => {
                    Expr::New {
                        constructor: id.name.to_string(),
                        arguments: self.arguments(&new_expr.arguments)?,
                    }
                }
                _ => return Err(self.unsupported(new_expr.span)),
            },
            Expression::UnaryExpression(unary) => {
                let op = match unary.operator.as_str() {
                    "-" => UnaryOp::Neg,
                    "+" => UnaryOp::Plus,
                    "!" => UnaryOp::Not,
                    "~" => UnaryOp::BitNot,
                    "typeof" => UnaryOp::TypeOf,
                    "void" => UnaryOp::Void,
                    "delete" => {
                        return Ok(Expr::Delete(Box::new(
                            self.expression_target(&unary.argument, unary.span)?,
                        )))
                    }
                    _ => return Err(self.unsupported(unary.span)),
                };
                Expr::Unary {
                    op,
                    argument: Box::new(self.expression(&unary.argument)?),
                }
            }
            Expression::BinaryExpression(bin) => Expr::Binary {
                op: binary_op(bin.operator.as_str()).ok_or_else(|| self.unsupported(bin.span))?,
                left: Box::new(self.expression(&bin.left)?),
                right: Box::new(self.expression(&bin.right)?),
            },
            Expression::LogicalExpression(logical) => Expr::Logical {
                op: logical_op(logical.operator.as_str())
                    .ok_or_else(|| self.unsupported(logical.span))?,
                left: Box::new(self.expression(&logical.left)?),
                right: Box::new(self.expression(&logical.right)?),
            },
            Expression::ConditionalExpression(cond) => Expr::Conditional {
                test: Box::new(self.expression(&cond.test)?),
                consequent: Box::new(self.expression(&cond.consequent)?),
                alternate: Box::new(self.expression(&cond.alternate)?),
            },
            Expression::AssignmentExpression(assign) => {
                let target = match &assign.left {
                    AssignmentTarget::AssignmentTargetIdentifier(id) => {
                        Target::Identifier(id.name.to_string())
                    }
                    AssignmentTarget::StaticMemberExpression(m) => Target::Member {
                        object: Box::new(self.expression(&m.object)?),
                        property: MemberKey::Static(m.property.name.to_string()),
                    },
                    AssignmentTarget::ComputedMemberExpression(m) => Target::Member {
                        object: Box::new(self.expression(&m.object)?),
                        property: MemberKey::Computed(Box::new(self.expression(&m.expression)?)),
                    },
                    _ => return Err(self.unsupported(assign.span)),
                };
                Expr::Assign {
                    op: assign_op(assign.operator.as_str())
                        .ok_or_else(|| self.unsupported(assign.span))?,
                    target: Box::new(target),
                    value: Box::new(self.expression(&assign.right)?),
                }
            }
            Expression::UpdateExpression(update) => {
                let target = match &update.argument {
                    SimpleAssignmentTarget::AssignmentTargetIdentifier(id) => {
                        Target::Identifier(id.name.to_string())
                    }
                    SimpleAssignmentTarget::StaticMemberExpression(m) => Target::Member {
                        object: Box::new(self.expression(&m.object)?),
                        property: MemberKey::Static(m.property.name.to_string()),
                    },
                    SimpleAssignmentTarget::ComputedMemberExpression(m) => Target::Member {
                        object: Box::new(self.expression(&m.object)?),
                        property: MemberKey::Computed(Box::new(self.expression(&m.expression)?)),
                    },
                    _ => return Err(self.unsupported(update.span)),
                };
                Expr::Update {
                    increment: update.operator.as_str() == "++",
                    prefix: update.prefix,
                    target: Box::new(target),
                }
            }
            Expression::SequenceExpression(seq) => {
                let mut items = Vec::new();
                for e in &seq.expressions {
                    items.push(self.expression(e)?);
                }
                Expr::Sequence(items)
            }
            Expression::ParenthesizedExpression(paren) => self.expression(&paren.expression)?,
            Expression::ArrowFunctionExpression(func) => {
                if func.r#async || func.params.rest.is_some() {
                    return Err(self.unsupported(func.span));
                }
                let mut params = Vec::new();
                for param in &func.params.items {
                    params.push(self.pattern(&param.pattern, func.span)?);
                }
                let body = if func.expression {
                    match func.body.statements.first() {
                        Some(OxcStatement::ExpressionStatement(stmt)) => {
                            ArrowBody::Expr(Box::new(self.expression(&stmt.expression)?))
                        }
                        _ => return Err(self.unsupported(func.span)),
                    }
                } else {
                    ArrowBody::Block(self.statements(&func.body.statements)?)
                };
                Expr::Arrow(Rc::new(Arrow { params, body }))
            }
            other => return Err(self.unsupported(other.span())),
        })
    }

    fn regex_literal(&self, span: Span) -> Result<Expr, CompileError> {
        let text = self
            .source
            .get(span.start as usize..span.end as usize)
            .unwrap_or_default();
        let close = text.rfind('/').unwrap_or(0);
        if close == 0 {
            return Err(self.unsupported(span));
        }
        let (pattern, flags) = (&text[1..close], &text[close + 1..]);
        let inline: String = flags.chars().filter(|f| matches!(f, 'i' | 'm' | 's')).collect();
        let full = if inline.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{}){}", inline, pattern)
        };
        Regex::new(&full)
            .map(|re| Expr::Literal(Value::RegExp(Rc::new(re))))
            .map_err(|e| CompileError::Syntax {
                expression: self.source.to_string(),
                message: e.to_string(),
            })
    }

    fn property_key(&self, key: &PropertyKey<'_>, span: Span) -> Result<String, CompileError> {
        match key {
            PropertyKey::StaticIdentifier(id) => Ok(id.name.to_string()),
            PropertyKey::StringLiteral(s) => Ok(s.value.to_string()),
            PropertyKey::NumericLiteral(n) => Ok(format_number(n.value)),
            _ => Err(self.unsupported(span)),
        }
    }

    fn static_member(&self, m: &ast::StaticMemberExpression<'_>) -> Result<Expr, CompileError> {
        Ok(Expr::Member {
            object: Box::new(self.expression(&m.object)?),
            property: MemberKey::Static(m.property.name.to_string()),
            optional: m.optional,
        })
    }

    fn computed_member(&self, m: &ast::ComputedMemberExpression<'_>) -> Result<Expr, CompileError> {
        Ok(Expr::Member {
            object: Box::new(self.expression(&m.object)?),
            property: MemberKey::Computed(Box::new(self.expression(&m.expression)?)),
            optional: m.optional,
        })
    }

    fn call(&self, call: &ast::CallExpression<'_>) -> Result<Expr, CompileError> {
        Ok(Expr::Call {
            callee: Box::new(self.expression(&call.callee)?),
            arguments: self.arguments(&call.arguments)?,
            optional: call.optional,
        })
    }

    fn arguments(&self, args: &[ast::Argument<'_>]) -> Result<Vec<Element>, CompileError> {
        let mut out = Vec::new();
        for arg in args {
            out.push(match arg {
                ast::Argument::SpreadElement(s) => Element::Spread(self.expression(&s.argument)?),
                other => match other.as_expression() {
                    Some(e) => Element::Item(self.expression(e)?),
                    None => return Err(self.unsupported(other.span())),
                },
            });
        }
        Ok(out)
    }

    /// Operand of `delete`.
    fn expression_target(&self, expr: &Expression<'_>, span: Span) -> Result<Target, CompileError> {
        match self.expression(expr)? {
            Expr::Member {
                object, property, ..
            } => Ok(Target::Member { object, property }),
            Expr::Identifier(name) => Ok(Target::Identifier(name)),
            _ => Err(self.unsupported(span)),
        }
    }

    fn pattern(&self, pattern: &BindingPattern<'_>, span: Span) -> Result<Pattern, CompileError> {
        match pattern {
            BindingPattern::BindingIdentifier(id) => Ok(Pattern::Identifier(id.name.to_string())),
            BindingPattern::ObjectPattern(obj) => {
                if obj.rest.is_some() {
                    return Err(self.unsupported(obj.span));
                }
                let mut props = Vec::new();
                for prop in &obj.properties {
                    let key = self.property_key(&prop.key, prop.span)?;
                    props.push((key, self.pattern(&prop.value, prop.span)?));
                }
                Ok(Pattern::Object(props))
            }
            BindingPattern::ArrayPattern(arr) => {
                if arr.rest.is_some() {
                    return Err(self.unsupported(arr.span));
                }
                let mut items = Vec::new();
                for elem in &arr.elements {
                    items.push(match elem {
                        Some(p) => Some(self.pattern(p, arr.span)?),
                        None => None,
                    });
                }
                Ok(Pattern::Array(items))
            }
            BindingPattern::AssignmentPattern(assign) => Ok(Pattern::Default(
                Box::new(self.pattern(&assign.left, assign.span)?),
                Box::new(self.expression(&assign.right)?),
            )),
            #[allow(unreachable_patterns)]
            _ => Err(self.unsupported(span)),
        }
    }

    fn statements(&self, stmts: &[OxcStatement<'_>]) -> Result<Vec<Statement>, CompileError> {
        let mut out = Vec::new();
        for stmt in stmts {
            match stmt {
                OxcStatement::VariableDeclaration(var) => {
                    for decl in &var.declarations {
                        let init = match &decl.init {
                            Some(init) => Some(self.expression(init)?),
                            None => None,
                        };
                        out.push(Statement::Let(self.pattern(&decl.id, decl.span)?, init));
                    }
                }
                OxcStatement::ExpressionStatement(s) => {
                    out.push(Statement::Expr(self.expression(&s.expression)?))
                }
                OxcStatement::ReturnStatement(ret) => out.push(Statement::Return(match &ret.argument {
                    Some(arg) => Some(self.expression(arg)?),
                    None => None,
                })),
                OxcStatement::IfStatement(if_stmt) => out.push(Statement::If {
                    test: self.expression(&if_stmt.test)?,
                    consequent: self.block_of(&if_stmt.consequent)?,
                    alternate: match &if_stmt.alternate {
                        Some(alt) => self.block_of(alt)?,
                        None => Vec::new(),
                    },
                }),
                OxcStatement::BlockStatement(block) => {
                    out.push(Statement::Block(self.statements(&block.body)?))
                }
                OxcStatement::EmptyStatement(_) => {}
                other => return Err(self.unsupported(other.span())),
            }
        }
        Ok(out)
    }

    fn block_of(&self, stmt: &OxcStatement<'_>) -> Result<Vec<Statement>, CompileError> {
        match stmt {
            OxcStatement::BlockStatement(block) => self.statements(&block.body),
            other => self.statements(std::slice::from_ref(other)),
        }
    }
}

fn binary_op(op: &str) -> Option<BinaryOp> {
    Some(match op {
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Rem,
        "**" => BinaryOp::Pow,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::NotEq,
        "===" => BinaryOp::StrictEq,
        "!==" => BinaryOp::StrictNotEq,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::LtEq,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::GtEq,
        "&" => BinaryOp::BitAnd,
        "|" => BinaryOp::BitOr,
        "^" => BinaryOp::BitXor,
        "<<" => BinaryOp::Shl,
        ">>" => BinaryOp::Shr,
        ">>>" => BinaryOp::UShr,
        "in" => BinaryOp::In,
        "instanceof" => BinaryOp::InstanceOf,
        _ => return None,
    })
}

fn logical_op(op: &str) -> Option<LogicalOp> {
    Some(match op {
        "&&" => LogicalOp::And,
        "||" => LogicalOp::Or,
        "??" => LogicalOp::Coalesce,
        _ => return None,
    })
}

fn assign_op(op: &str) -> Option<AssignOp> {
    Some(match op {
        "=" => AssignOp::Assign,
        "&&=" => AssignOp::Logical(LogicalOp::And),
        "||=" => AssignOp::Logical(LogicalOp::Or),
        "??=" => AssignOp::Logical(LogicalOp::Coalesce),
        compound => AssignOp::Compound(binary_op(compound.strip_suffix('=')?)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ERR_SYNTAX, ERR_UNSUPPORTED};

    #[test]
    fn test_lowers_member_chain() {
        let expr = parse_expression("user.profile[0].name").unwrap();
        match expr {
            Expr::Member {
                property: MemberKey::Static(name),
                ..
            } => assert_eq!(name, "name"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_lowers_arrow_with_block_body() {
        let expr = parse_expression("(a, { b }) => { const c = a + b; if (c > 1) return c; return 0; }")
            .unwrap();
        match expr {
            Expr::Arrow(arrow) => {
                assert_eq!(arrow.params.len(), 2);
                match &arrow.body {
                    ArrowBody::Block(stmts) => assert_eq!(stmts.len(), 3),
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_compound_assignment_operators() {
        assert_eq!(assign_op("+="), Some(AssignOp::Compound(BinaryOp::Add)));
        assert_eq!(assign_op(">>>="), Some(AssignOp::Compound(BinaryOp::UShr)));
        assert_eq!(assign_op("??="), Some(AssignOp::Logical(LogicalOp::Coalesce)));
    }

    #[test]
    fn test_syntax_error_is_construction_failure() {
        let err = parse_expression("a +").unwrap_err();
        assert_eq!(err.code(), ERR_SYNTAX);
    }

    #[test]
    fn test_function_expression_is_unsupported() {
        let err = parse_expression("function () { return 1 }").unwrap_err();
        assert_eq!(err.code(), ERR_UNSUPPORTED);
    }

    #[test]
    fn test_regex_literal_flags() {
        match parse_expression("/^ab+c$/i").unwrap() {
            Expr::Literal(Value::RegExp(re)) => assert!(re.is_match("ABBC")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
