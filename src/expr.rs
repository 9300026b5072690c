use std::collections::BTreeMap;

use anyhow::{Context as _, Result};
use chrono::{Datelike, Duration, NaiveDate};
use evalexpr::{
    Context, ContextWithMutableFunctions, ContextWithMutableVariables, EvalexprError, Function,
    HashMapContext, Value as EvalValue, eval_with_context,
};
use heck::ToSnakeCase;
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;

use crate::{
    data::{
        Value, normalize_column_name, parse_amount, parse_naive_date, parse_naive_datetime,
        value_to_evalexpr,
    },
    dataset::Column,
};

/// Named values bound by `let` and `measure` statements.
pub type Scalars = BTreeMap<String, EvalValue>;

fn register_string_functions(context: &mut HashMapContext) -> Result<()> {
    context
        .set_function(
            "lowercase".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 1, "lowercase")?;
                Ok(EvalValue::String(expect_string(&args[0], "value")?.to_lowercase()))
            }),
        )
        .map_err(anyhow::Error::from)?;

    context
        .set_function(
            "uppercase".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 1, "uppercase")?;
                Ok(EvalValue::String(expect_string(&args[0], "value")?.to_uppercase()))
            }),
        )
        .map_err(anyhow::Error::from)?;

    context
        .set_function(
            "trim".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 1, "trim")?;
                Ok(EvalValue::String(expect_string(&args[0], "value")?.trim().to_string()))
            }),
        )
        .map_err(anyhow::Error::from)?;

    context
        .set_function(
            "snake_case".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 1, "snake_case")?;
                Ok(EvalValue::String(expect_string(&args[0], "value")?.to_snake_case()))
            }),
        )
        .map_err(anyhow::Error::from)?;

    context
        .set_function(
            "substring".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 3, "substring")?;
                let value = expect_string(&args[0], "value")?;
                let start = parse_i64_arg(&args[1], "start")?.max(0) as usize;
                let length = parse_i64_arg(&args[2], "length")?.max(0) as usize;
                Ok(EvalValue::String(value.chars().skip(start).take(length).collect()))
            }),
        )
        .map_err(anyhow::Error::from)?;

    context
        .set_function(
            "regex_replace".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 3, "regex_replace")?;
                let value = expect_string(&args[0], "value")?;
                let pattern = expect_string(&args[1], "pattern")?;
                let replacement = expect_string(&args[2], "replacement")?;
                let regex = Regex::new(pattern)
                    .map_err(|err| eval_error(&format!("Invalid regex: {err}")))?;
                Ok(EvalValue::String(regex.replace_all(value, replacement).into_owned()))
            }),
        )
        .map_err(anyhow::Error::from)?;

    context
        .set_function(
            "contains".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 2, "contains")?;
                let value = expect_string(&args[0], "value")?;
                let needle = expect_string(&args[1], "needle")?;
                Ok(EvalValue::Boolean(value.contains(needle)))
            }),
        )
        .map_err(anyhow::Error::from)?;

    context
        .set_function(
            "starts_with".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 2, "starts_with")?;
                let value = expect_string(&args[0], "value")?;
                let prefix = expect_string(&args[1], "prefix")?;
                Ok(EvalValue::Boolean(value.starts_with(prefix)))
            }),
        )
        .map_err(anyhow::Error::from)?;

    context
        .set_function(
            "is_empty".into(),
            Function::new(|arguments| {
                Ok(EvalValue::Boolean(match arguments {
                    EvalValue::String(s) => s.trim().is_empty(),
                    EvalValue::Empty => true,
                    _ => false,
                }))
            }),
        )
        .map_err(anyhow::Error::from)?;

    Ok(())
}

fn register_numeric_functions(context: &mut HashMapContext) -> Result<()> {
    context
        .set_function(
            "amount".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 1, "amount")?;
                parse_amount_arg(&args[0])
            }),
        )
        .map_err(anyhow::Error::from)?;

    context
        .set_function(
            "amount_or".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 2, "amount_or")?;
                match parse_amount_arg(&args[0]) {
                    Ok(value) => Ok(value),
                    Err(_) => Ok(EvalValue::Float(parse_f64_arg(&args[1], "default")?)),
                }
            }),
        )
        .map_err(anyhow::Error::from)?;

    context
        .set_function(
            "abs".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 1, "abs")?;
                match &args[0] {
                    EvalValue::Int(i) => Ok(EvalValue::Int(i.saturating_abs())),
                    other => Ok(EvalValue::Float(parse_f64_arg(other, "value")?.abs())),
                }
            }),
        )
        .map_err(anyhow::Error::from)?;

    context
        .set_function(
            "round_to".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 2, "round_to")?;
                let value = parse_f64_arg(&args[0], "value")?;
                let digits = parse_i64_arg(&args[1], "digits")?.clamp(0, 12) as i32;
                let factor = 10_f64.powi(digits);
                Ok(EvalValue::Float((value * factor).round() / factor))
            }),
        )
        .map_err(anyhow::Error::from)?;

    Ok(())
}

fn register_temporal_functions(context: &mut HashMapContext) -> Result<()> {
    context
        .set_function(
            "date_add".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 2, "date_add")?;
                let date = parse_date_arg(&args[0])?;
                let days = parse_i64_arg(&args[1], "days")?;
                let result = date
                    .checked_add_signed(Duration::days(days))
                    .ok_or_else(|| eval_error("date_add overflow"))?;
                Ok(EvalValue::String(result.format("%Y-%m-%d").to_string()))
            }),
        )
        .map_err(anyhow::Error::from)?;

    context
        .set_function(
            "date_diff_days".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 2, "date_diff_days")?;
                let end = parse_date_arg(&args[0])?;
                let start = parse_date_arg(&args[1])?;
                Ok(EvalValue::Int((end - start).num_days()))
            }),
        )
        .map_err(anyhow::Error::from)?;

    context
        .set_function(
            "year".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 1, "year")?;
                Ok(EvalValue::Int(i64::from(parse_date_arg(&args[0])?.year())))
            }),
        )
        .map_err(anyhow::Error::from)?;

    context
        .set_function(
            "month".into(),
            Function::new(|arguments| {
                let args = expect_args(arguments, 1, "month")?;
                Ok(EvalValue::Int(i64::from(parse_date_arg(&args[0])?.month())))
            }),
        )
        .map_err(anyhow::Error::from)?;

    Ok(())
}

fn expect_args(
    arguments: &EvalValue,
    expected: usize,
    name: &str,
) -> Result<Vec<EvalValue>, EvalexprError> {
    match arguments {
        EvalValue::Tuple(values) if values.len() == expected => Ok(values.clone()),
        EvalValue::Tuple(values) => Err(eval_error(&format!(
            "{name} expects {expected} argument(s), got {}",
            values.len()
        ))),
        value if expected == 1 => Ok(vec![value.clone()]),
        _ => Err(eval_error(&format!("{name} expects {expected} arguments"))),
    }
}

fn eval_error(message: &str) -> EvalexprError {
    EvalexprError::CustomMessage(message.to_string())
}

fn parse_date_arg(value: &EvalValue) -> Result<NaiveDate, EvalexprError> {
    let raw = expect_string(value, "date")?;
    parse_naive_date(raw)
        .or_else(|_| parse_naive_datetime(raw).map(|dt| dt.date()))
        .map_err(|err| eval_error(&err.to_string()))
}

fn parse_i64_arg(value: &EvalValue, name: &str) -> Result<i64, EvalexprError> {
    match value {
        EvalValue::Int(i) => Ok(*i),
        EvalValue::Float(f) => Ok(*f as i64),
        other => Err(eval_error(&format!("Expected integer for {name}, got {other:?}"))),
    }
}

fn parse_f64_arg(value: &EvalValue, name: &str) -> Result<f64, EvalexprError> {
    match value {
        EvalValue::Int(i) => Ok(*i as f64),
        EvalValue::Float(f) => Ok(*f),
        other => Err(eval_error(&format!("Expected number for {name}, got {other:?}"))),
    }
}

fn parse_amount_arg(value: &EvalValue) -> Result<EvalValue, EvalexprError> {
    match value {
        EvalValue::Int(_) | EvalValue::Float(_) => Ok(value.clone()),
        EvalValue::String(raw) => parse_amount(raw)
            .and_then(|d| d.to_f64())
            .map(EvalValue::Float)
            .ok_or_else(|| eval_error(&format!("Cannot read '{raw}' as an amount"))),
        other => Err(eval_error(&format!("Cannot read {other:?} as an amount"))),
    }
}

fn expect_string<'a>(value: &'a EvalValue, name: &str) -> Result<&'a str, EvalexprError> {
    if let EvalValue::String(s) = value {
        Ok(s)
    } else {
        Err(eval_error(&format!("Expected string for {name}")))
    }
}

fn function_context() -> Result<HashMapContext> {
    let mut context = HashMapContext::new();
    register_string_functions(&mut context)?;
    register_numeric_functions(&mut context)?;
    register_temporal_functions(&mut context)?;
    Ok(context)
}

fn bind_scalars(context: &mut HashMapContext, scalars: &Scalars) -> Result<()> {
    for (name, value) in scalars {
        // Columns win over scalars of the same name.
        if context.get_value(name).is_some() {
            continue;
        }
        context
            .set_value(name.clone(), value.clone())
            .with_context(|| format!("Binding scalar '{name}'"))?;
    }
    Ok(())
}

/// Context with only scalars and functions, for statements that do not
/// iterate rows.
pub fn build_scalar_context(scalars: &Scalars) -> Result<HashMapContext> {
    let mut context = function_context()?;
    bind_scalars(&mut context, scalars)?;
    Ok(context)
}

pub fn build_row_context(
    columns: &[Column],
    row: &[Option<Value>],
    row_number: usize,
    scalars: &Scalars,
) -> Result<HashMapContext> {
    let mut context = function_context()?;
    for (idx, column) in columns.iter().enumerate() {
        let value = match row.get(idx) {
            Some(Some(value)) => value_to_evalexpr(value),
            _ => EvalValue::String(String::new()),
        };
        let canon = normalize_column_name(&column.name);
        if context.get_value(&canon).is_none() {
            context
                .set_value(canon, value.clone())
                .with_context(|| format!("Binding column '{}'", column.name))?;
        }
        context
            .set_value(format!("c{idx}"), value)
            .with_context(|| format!("Binding column index {idx}"))?;
    }
    context
        .set_value("row_number".to_string(), EvalValue::Int(row_number as i64))
        .context("Binding row_number")?;
    bind_scalars(&mut context, scalars)?;
    Ok(context)
}

pub fn evaluate(expr: &str, context: &HashMapContext) -> Result<EvalValue> {
    eval_with_context(expr, context).with_context(|| format!("Evaluating expression '{expr}'"))
}

pub fn evaluate_to_bool(expr: &str, context: &HashMapContext) -> Result<bool> {
    Ok(eval_value_truthy(evaluate(expr, context)?))
}

pub fn eval_value_truthy(value: EvalValue) -> bool {
    match value {
        EvalValue::Boolean(b) => b,
        EvalValue::Int(i) => i != 0,
        EvalValue::Float(f) => f != 0.0,
        EvalValue::String(s) => !s.is_empty(),
        EvalValue::Tuple(values) => values.into_iter().any(eval_value_truthy),
        EvalValue::Empty => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("Order ID", ColumnType::String),
            Column::new("Amount", ColumnType::String),
            Column::new("Placed", ColumnType::Date),
        ]
    }

    fn row() -> Vec<Option<Value>> {
        vec![
            Some(Value::String("  SO-1 ".into())),
            Some(Value::String("$1,200.50".into())),
            Some(Value::Date(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap())),
        ]
    }

    #[test]
    fn columns_bind_by_name_and_position() {
        let ctx = build_row_context(&columns(), &row(), 1, &Scalars::new()).unwrap();
        assert_eq!(
            evaluate("trim(order_id)", &ctx).unwrap(),
            EvalValue::String("SO-1".into())
        );
        assert_eq!(
            evaluate("lowercase(trim(c0))", &ctx).unwrap(),
            EvalValue::String("so-1".into())
        );
        assert_eq!(evaluate("row_number", &ctx).unwrap(), EvalValue::Int(1));
    }

    #[test]
    fn amounts_and_dates_are_usable_in_predicates() {
        let ctx = build_row_context(&columns(), &row(), 1, &Scalars::new()).unwrap();
        assert!(evaluate_to_bool("amount(amount) > 1200.0", &ctx).unwrap());
        assert_eq!(evaluate("year(placed)", &ctx).unwrap(), EvalValue::Int(2024));
        assert_eq!(evaluate("month(placed)", &ctx).unwrap(), EvalValue::Int(3));
        assert_eq!(
            evaluate("date_add(placed, 30)", &ctx).unwrap(),
            EvalValue::String("2024-04-08".into())
        );
        assert_eq!(
            evaluate("date_diff_days(\"2024-03-19\", placed)", &ctx).unwrap(),
            EvalValue::Int(10)
        );
    }

    #[test]
    fn nulls_bind_as_empty_strings() {
        let ctx = build_row_context(&columns(), &[None, None, None], 2, &Scalars::new()).unwrap();
        assert!(evaluate_to_bool("is_empty(order_id)", &ctx).unwrap());
        assert!(evaluate("amount(c1)", &ctx).is_err());
        assert_eq!(
            evaluate("amount_or(c1, 0)", &ctx).unwrap(),
            EvalValue::Float(0.0)
        );
    }

    #[test]
    fn scalars_do_not_shadow_columns() {
        let mut scalars = Scalars::new();
        scalars.insert("threshold".into(), EvalValue::Int(10));
        scalars.insert("order_id".into(), EvalValue::Int(7));
        let ctx = build_row_context(&columns(), &row(), 1, &scalars).unwrap();
        assert_eq!(evaluate("threshold * 2", &ctx).unwrap(), EvalValue::Int(20));
        assert_eq!(
            evaluate("order_id", &ctx).unwrap(),
            EvalValue::String("  SO-1 ".into())
        );
    }

    #[test]
    fn string_helpers_follow_chars_not_bytes() {
        let ctx = build_scalar_context(&Scalars::new()).unwrap();
        assert_eq!(
            evaluate("substring(\"腾讯科技有限公司\", 0, 2)", &ctx).unwrap(),
            EvalValue::String("腾讯".into())
        );
        assert_eq!(
            evaluate("regex_replace(\"a-b-c\", \"-\", \"\")", &ctx).unwrap(),
            EvalValue::String("abc".into())
        );
        assert_eq!(
            evaluate("snake_case(\"Order Total\")", &ctx).unwrap(),
            EvalValue::String("order_total".into())
        );
        assert!(
            evaluate_to_bool(
                "contains(\"Acme Ltd\", \"Ltd\") && starts_with(\"Acme\", \"Ac\")",
                &ctx
            )
            .unwrap()
        );
        assert_eq!(evaluate("round_to(2.3456, 2)", &ctx).unwrap(), EvalValue::Float(2.35));
        assert_eq!(evaluate("abs(-4)", &ctx).unwrap(), EvalValue::Int(4));
    }

    #[test]
    fn wrong_arity_is_an_error() {
        let ctx = build_scalar_context(&Scalars::new()).unwrap();
        assert!(evaluate("substring(\"abc\", 1)", &ctx).is_err());
    }
}
