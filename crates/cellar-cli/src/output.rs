//! Output rendering: JSON passthrough or a simple aligned table for arrays
//! of flat objects.

use colored::Colorize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Json,
    Table,
}

impl OutputMode {
    pub fn from_flags(json: bool, format: Option<&str>) -> Self {
        if json {
            return OutputMode::Json;
        }
        match format {
            Some("json") => OutputMode::Json,
            _ => OutputMode::Table,
        }
    }
}

pub fn print_value(value: &serde_json::Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
        }
        OutputMode::Table => match value {
            serde_json::Value::Array(items) => print_table(items),
            other => println!(
                "{}",
                serde_json::to_string_pretty(other).unwrap_or_default()
            ),
        },
    }
}

fn print_table(items: &[serde_json::Value]) {
    if items.is_empty() {
        println!("{}", "(empty)".dimmed());
        return;
    }

    // Columns: union of scalar keys in row order of first appearance.
    let mut columns: Vec<String> = Vec::new();
    for item in items {
        if let Some(object) = item.as_object() {
            for (key, cell) in object {
                if !cell.is_object() && !cell.is_array() && !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
    }
    if columns.is_empty() {
        println!("{}", serde_json::to_string_pretty(items).unwrap_or_default());
        return;
    }

    let render = |value: Option<&serde_json::Value>| -> String {
        match value {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    };

    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|item| {
            columns
                .iter()
                .enumerate()
                .map(|(i, column)| {
                    let cell = render(item.get(column));
                    widths[i] = widths[i].max(cell.len());
                    cell
                })
                .collect()
        })
        .collect();

    let header: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{:w$}", c, w = widths[i]))
        .collect();
    println!("{}", header.join("  ").bold());
    for row in rows {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:w$}", cell, w = widths[i]))
            .collect();
        println!("{}", line.join("  "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_resolution() {
        assert_eq!(OutputMode::from_flags(true, None), OutputMode::Json);
        assert_eq!(OutputMode::from_flags(false, Some("json")), OutputMode::Json);
        assert_eq!(OutputMode::from_flags(false, Some("table")), OutputMode::Table);
        assert_eq!(OutputMode::from_flags(false, None), OutputMode::Table);
    }
}
