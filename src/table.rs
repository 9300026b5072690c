use std::borrow::Cow;
use std::fmt::Write as _;

/// Longest cell rendered before truncation with an ellipsis.
pub const MAX_CELL_WIDTH: usize = 40;

/// Renders an aligned plain-text table, as printed into sandbox logs and
/// schema summaries.
pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let column_count = headers.len();
    let mut widths = headers
        .iter()
        .map(|h| display_width(&clip(h)))
        .collect::<Vec<_>>();

    for row in rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            widths[idx] = widths[idx].max(display_width(&clip(cell)));
        }
    }
    for width in &mut widths {
        *width = (*width).max(1);
    }

    let mut output = String::new();
    let _ = writeln!(output, "{}", format_row(headers, &widths));
    let separator_widths = widths.iter().map(|w| (*w).max(3)).collect::<Vec<usize>>();
    let separator_cells = separator_widths
        .iter()
        .map(|w| "-".repeat(*w))
        .collect::<Vec<_>>();
    let _ = writeln!(output, "{}", format_row(&separator_cells, &separator_widths));
    for row in rows {
        let _ = writeln!(output, "{}", format_row(row, &widths));
    }
    output
}

fn format_row(values: &[String], widths: &[usize]) -> String {
    let mut cells = Vec::with_capacity(values.len());
    for (idx, value) in values.iter().enumerate().take(widths.len()) {
        let clipped = clip(value);
        let padding = widths[idx].saturating_sub(display_width(&clipped));
        let mut cell = clipped.into_owned();
        cell.push_str(&" ".repeat(padding));
        cells.push(cell);
    }
    cells.join("  ").trim_end().to_string()
}

/// Terminal width of `value`: East Asian wide characters take two columns.
pub fn display_width(value: &str) -> usize {
    value.chars().map(char_width).sum()
}

fn char_width(ch: char) -> usize {
    match ch as u32 {
        0x1100..=0x115F
        | 0x2E80..=0x303E
        | 0x3041..=0x33FF
        | 0x3400..=0x4DBF
        | 0x4E00..=0x9FFF
        | 0xA000..=0xA4CF
        | 0xAC00..=0xD7A3
        | 0xF900..=0xFAFF
        | 0xFE30..=0xFE4F
        | 0xFF00..=0xFF60
        | 0xFFE0..=0xFFE6 => 2,
        _ => 1,
    }
}

fn clip(value: &str) -> Cow<'_, str> {
    let sanitized: Cow<'_, str> = if value.contains(['\n', '\r', '\t']) {
        Cow::Owned(value.replace(['\n', '\r', '\t'], " "))
    } else {
        Cow::Borrowed(value)
    };
    if display_width(&sanitized) <= MAX_CELL_WIDTH {
        return sanitized;
    }
    let mut clipped = String::new();
    let mut width = 0;
    for ch in sanitized.chars() {
        let w = char_width(ch);
        if width + w > MAX_CELL_WIDTH - 1 {
            break;
        }
        width += w;
        clipped.push(ch);
    }
    clipped.push('…');
    Cow::Owned(clipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_table_aligns_columns() {
        let headers = vec!["id".to_string(), "name".to_string()];
        let rows = vec![
            vec!["1".to_string(), "Alice".to_string()],
            vec!["2".to_string(), "Bob".to_string()],
        ];
        let rendered = render_table(&headers, &rows);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines, vec!["id  name", "---  -----", "1   Alice", "2   Bob"]);
    }

    #[test]
    fn wide_characters_count_double() {
        assert_eq!(display_width("腾讯"), 4);
        assert_eq!(display_width("abc"), 3);
    }

    #[test]
    fn long_cells_are_clipped_and_control_characters_flattened() {
        let headers = vec!["note".to_string()];
        let rows = vec![vec!["x".repeat(100)], vec!["a\nb".to_string()]];
        let rendered = render_table(&headers, &rows);
        let lines: Vec<&str> = rendered.lines().collect();
        assert!(lines[2].ends_with('…'));
        assert_eq!(display_width(lines[2]), MAX_CELL_WIDTH);
        assert_eq!(lines[3], "a b");
    }
}
