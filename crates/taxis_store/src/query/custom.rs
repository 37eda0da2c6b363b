//! Configured join conditions. Backtick symbols name model elements and are
//! replaced by physical names; `:name` placeholders bind context parameters.

use sea_query::{Expr, SimpleExpr, Value as SeaValue};

use aideon_taxis_core::{StorageRule, TaxisError, TaxisResult};

use super::QueryBuildContext;

/// Rewrites a custom condition into SQL with `?` placeholders.
///
/// * `` `Type` `` becomes the type's table.
/// * `` `Type.member` `` becomes the attribute or foreign key column.
/// * `` `@source` `` / `` `@target` `` become the partner and joined aliases.
///
/// Identifiers are emitted unquoted. Text inside single quotes and `::`
/// casts are copied as is.
pub fn resolve_condition(
    ctx: &QueryBuildContext<'_>,
    condition: &str,
    source: &str,
    target: &str,
) -> TaxisResult<SimpleExpr> {
    let mut sql = String::with_capacity(condition.len());
    let mut values: Vec<SeaValue> = Vec::new();
    let mut chars = condition.chars().peekable();
    let mut quoted = false;
    while let Some(ch) = chars.next() {
        if quoted {
            sql.push(ch);
            if ch == '\'' {
                quoted = false;
            }
            continue;
        }
        match ch {
            '\'' => {
                quoted = true;
                sql.push(ch);
            }
            '`' => {
                let mut symbol = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '`' {
                        closed = true;
                        break;
                    }
                    symbol.push(next);
                }
                if !closed {
                    return Err(TaxisError::configuration(format!(
                        "unterminated backtick in custom join condition `{condition}`"
                    )));
                }
                sql.push_str(&resolve_symbol(ctx, &symbol, source, target)?);
            }
            ':' if chars.peek() == Some(&':') => {
                sql.push_str("::");
                chars.next();
            }
            ':' if chars.peek().is_some_and(|next| next.is_ascii_alphabetic() || *next == '_') => {
                let mut name = String::new();
                while let Some(next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || *next == '_' {
                        name.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = ctx.param(&name)?;
                values.push(ctx.bind(&value, true));
                sql.push('?');
            }
            other => sql.push(other),
        }
    }
    Ok(Expr::cust_with_values(sql, values))
}

fn resolve_symbol(
    ctx: &QueryBuildContext<'_>,
    symbol: &str,
    source: &str,
    target: &str,
) -> TaxisResult<String> {
    match symbol {
        "@source" => return Ok(source.to_string()),
        "@target" => return Ok(target.to_string()),
        _ => {}
    }
    let resolver = ctx.resolver;
    let Some((entity_type, member)) = symbol.split_once('.') else {
        return Ok(resolver.table_name(symbol)?.to_string());
    };
    if let Some((_, attribute)) = resolver.attribute(entity_type, member)? {
        return Ok(attribute.column().to_string());
    }
    match resolver.reference(entity_type, member)? {
        Some((key, def)) if def.storage != StorageRule::JoinTable => {
            Ok(resolver.reference_column(&key)?.to_string())
        }
        _ => Err(TaxisError::configuration(format!(
            "`{symbol}` does not name a column"
        ))),
    }
}
