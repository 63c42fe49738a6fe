use serde::Serialize;
use std::fmt::Display;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print left-aligned columns sized to the widest cell, with a dashed rule
/// under the header.
pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let widths = column_widths(headers, &rows);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();

    println!("{}", pad_row(headers.iter().copied(), &widths));
    println!("{}", rule.join("  "));
    for row in &rows {
        println!("{}", pad_row(row.iter().map(String::as_str), &widths));
    }
}

fn column_widths(headers: &[&str], rows: &[Vec<String>]) -> Vec<usize> {
    headers
        .iter()
        .enumerate()
        .map(|(i, header)| {
            rows.iter()
                .filter_map(|row| row.get(i))
                .map(String::len)
                .fold(header.len(), usize::max)
        })
        .collect()
}

fn pad_row<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let padded: Vec<String> = cells
        .zip(widths)
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect();
    padded.join("  ").trim_end().to_string()
}

/// Short form of a UUID for tables; full ids are in `--json` output.
pub fn short_id(id: impl Display) -> String {
    id.to_string().chars().take(8).collect()
}

pub fn or_dash(value: Option<impl Display>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_cover_longest_cell() {
        let rows = vec![
            vec!["vnet-1".to_string(), "done_successful".to_string()],
            vec!["a".to_string(), "failed".to_string()],
        ];
        assert_eq!(column_widths(&["NAME", "STATUS"], &rows), vec![6, 15]);
    }

    #[test]
    fn padded_rows_drop_trailing_space() {
        let row = pad_row(["vm", ""].into_iter(), &[4, 7]);
        assert_eq!(row, "vm");
    }

    #[test]
    fn short_id_truncates_uuid() {
        assert_eq!(short_id("0b7c9e52-1f4d-4b8e-9c1a-2d3e4f5a6b7c"), "0b7c9e52");
        assert_eq!(or_dash(None::<String>), "-");
    }
}
