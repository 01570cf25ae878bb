use sqlfarm_core::{DataValue, Result, SqlFarmError};

/// MySQL-style literal for a single argument.
pub fn escape_literal(value: &DataValue) -> String {
    match value {
        DataValue::Null => "NULL".to_string(),
        DataValue::Int64(v) => v.to_string(),
        DataValue::Float64(v) => format!("{v:?}"),
        DataValue::Bool(v) => if *v { "1" } else { "0" }.to_string(),
        DataValue::String(v) => quote(v),
        DataValue::Bytes(v) => {
            let hex: String = v.iter().map(|b| format!("{b:02X}")).collect();
            format!("X'{hex}'")
        }
    }
}

fn quote(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('\'');
    for ch in raw.chars() {
        match ch {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\x1a' => out.push_str("\\Z"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// Substitutes `%s` placeholders with rendered literals and collapses `%%`,
/// matching what the driver does with the same statement and arguments.
pub fn interpolate<F>(sql: &str, args: &[DataValue], literal: F) -> Result<String>
where
    F: Fn(&DataValue) -> String,
{
    let mut out = String::with_capacity(sql.len());
    let mut args_iter = args.iter();
    let mut chars = sql.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('s') => {
                let value = args_iter.next().ok_or_else(|| {
                    SqlFarmError::Sql(format!("not enough arguments for statement: {sql}"))
                })?;
                out.push_str(&literal(value));
            }
            Some(other) => {
                return Err(SqlFarmError::Sql(format!(
                    "unsupported placeholder %{other} in statement: {sql}"
                )))
            }
            None => {
                return Err(SqlFarmError::Sql(format!(
                    "incomplete placeholder in statement: {sql}"
                )))
            }
        }
    }
    if args_iter.next().is_some() {
        return Err(SqlFarmError::Sql(format!(
            "not all arguments converted for statement: {sql}"
        )));
    }
    Ok(out)
}

/// Raw `%` left in a statement that was given no arguments usually means a
/// value was pasted into the text instead of passed as a parameter.
pub fn has_placeholder(sql: &str) -> bool {
    sql.contains('%')
}
