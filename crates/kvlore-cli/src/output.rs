//! Output formatting utilities.

use colored::Colorize;

/// Format a table.
pub fn format_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    if rows.is_empty() {
        return String::new();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut output = String::new();
    let header = pad_line(headers.iter().copied(), &widths);
    output.push_str(&format!("{}\n", header.bright_cyan().bold()));

    let sep: String = widths
        .iter()
        .map(|w| "─".repeat(*w))
        .collect::<Vec<_>>()
        .join("─┼─");
    output.push_str(&format!("{sep}\n"));

    for row in rows {
        output.push_str(&pad_line(row.iter().map(String::as_str), &widths));
        output.push('\n');
    }

    output
}

fn pad_line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    cells
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:width$}"))
        .collect::<Vec<_>>()
        .join(" │ ")
}

/// Format a key-value list.
pub fn format_kv_list(items: &[(&str, String)]) -> String {
    let max_key_len = items.iter().map(|(k, _)| k.len()).max().unwrap_or(0);

    items
        .iter()
        .map(|(k, v)| {
            format!(
                "  {}: {}",
                format!("{:width$}", k, width = max_key_len).bright_cyan(),
                v
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format bytes as human-readable string.
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format duration.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 0.001 {
        format!("{:.2} µs", seconds * 1_000_000.0)
    } else if seconds < 1.0 {
        format!("{:.2} ms", seconds * 1000.0)
    } else {
        format!("{:.2} s", seconds)
    }
}

/// Format number with commas.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// First `max` characters of `text` on one line, with an ellipsis when cut.
pub fn preview(text: &str, max: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if flat.chars().count() <= max {
        flat
    } else {
        let mut cut: String = flat.chars().take(max.saturating_sub(1)).collect();
        cut.push('…');
        cut
    }
}

/// Print a section header.
pub fn print_section(title: &str) {
    println!("\n{}", title.bright_green().bold());
    println!("{}", "─".repeat(title.len()).bright_green());
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".bright_green(), message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_preview_cuts_on_chars() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("line one\nline two", 40), "line one line two");
        assert_eq!(preview("héllo wörld", 6), "héllo…");
    }

    #[test]
    fn test_table_widths() {
        colored::control::set_override(false);
        let table = format_table(
            &["#", "speaker"],
            &[vec!["1".into(), "ada".into()], vec!["12".into(), "b".into()]],
        );
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines[0], "#  │ speaker");
        assert_eq!(lines[2], "1  │ ada    ");
        assert_eq!(lines[3], "12 │ b      ");
    }
}
