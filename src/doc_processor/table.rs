//! Rebuilding readable tables from raw detector grids.
//!
//! PDF tables come back from detection with headers wrapped over several
//! rows and data cells wrapped over several lines. Both are undone here
//! before the table is rendered as markdown.

use crate::config::TableHeuristics;

/// A table exactly as a detector reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    /// 1-based page number.
    pub page: u32,
    pub grid: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(page: u32, grid: Vec<Vec<String>>) -> Self {
        Self { page, grid }
    }

    pub fn column_count(&self) -> usize {
        self.grid.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Pad ragged rows with empty cells so every row has the same width.
    fn normalized_grid(&self) -> Vec<Vec<String>> {
        let width = self.column_count();
        self.grid
            .iter()
            .map(|row| {
                let mut row = row.clone();
                row.resize(width, String::new());
                row
            })
            .collect()
    }
}

/// A reconstructed table: one header row plus data rows of equal width.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Run both reconstruction passes over a raw table.
pub fn reconstruct(raw: &RawTable, heuristics: &TableHeuristics) -> Table {
    let table = merge_multiline_header(raw.normalized_grid(), heuristics);
    clean_multiline_rows(table, heuristics)
}

fn is_header_like(row: &[String], ratio: f64) -> bool {
    let joined: String = row.concat();
    let text_chars = joined
        .chars()
        .filter(|c| c.is_alphabetic() || c.is_whitespace())
        .count();
    let total: usize = row.iter().map(|cell| cell.chars().count()).sum();
    text_chars as f64 > ratio * total as f64
}

/// Fold the leading header-like rows into a single header.
///
/// Scanning stops at the first row that is not header-like. With no header
/// rows the header falls back to column positions (`0`, `1`, ...).
pub fn merge_multiline_header(grid: Vec<Vec<String>>, heuristics: &TableHeuristics) -> Table {
    let width = grid.iter().map(Vec::len).max().unwrap_or(0);
    let scan = heuristics.max_header_rows.min(grid.len());

    let header_count = grid[..scan]
        .iter()
        .take_while(|row| is_header_like(row, heuristics.header_text_ratio))
        .count();

    let header = match header_count {
        0 => (0..width).map(|i| i.to_string()).collect(),
        1 => {
            let mut header = grid[0].clone();
            header.resize(width, String::new());
            header
        }
        n => (0..width)
            .map(|col| {
                grid[..n]
                    .iter()
                    .map(|row| row.get(col).map(String::as_str).unwrap_or(""))
                    .filter(|cell| !cell.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
                    .trim()
                    .to_string()
            })
            .collect(),
    };

    Table {
        header,
        rows: grid.into_iter().skip(header_count).collect(),
    }
}

/// Glue continuation rows back onto the row they wrapped from.
///
/// A row with at least `floor(ncols * min_filled_fraction)` non-blank cells
/// starts a new record; anything sparser is appended cell by cell to the
/// pending record.
pub fn clean_multiline_rows(table: Table, heuristics: &TableHeuristics) -> Table {
    let ncols = table.header.len();
    let min_filled = (ncols as f64 * heuristics.min_filled_fraction).floor() as usize;

    let mut cleaned: Vec<Vec<String>> = Vec::new();
    let mut current = vec![String::new(); ncols];

    for mut row in table.rows {
        row.resize(ncols, String::new());
        let non_empty = row.iter().filter(|cell| !cell.trim().is_empty()).count();
        if non_empty >= min_filled {
            if current.iter().any(|cell| !cell.is_empty()) {
                cleaned.push(current);
            }
            current = row;
        } else {
            for (i, cell) in row.iter().enumerate() {
                if !cell.is_empty() {
                    current[i] = format!("{} {}", current[i], cell).trim().to_string();
                }
            }
        }
    }
    if current.iter().any(|cell| !cell.is_empty()) {
        cleaned.push(current);
    }

    Table {
        header: table.header,
        rows: cleaned,
    }
}

fn is_numeric_column(table: &Table, col: usize) -> bool {
    let mut seen = false;
    for row in &table.rows {
        let cell = row.get(col).map(|c| c.trim()).unwrap_or("");
        if cell.is_empty() {
            continue;
        }
        if cell.replace(',', "").parse::<f64>().is_err() {
            return false;
        }
        seen = true;
    }
    seen
}

fn cell_text(cell: &str) -> String {
    cell.replace(['\n', '\r'], " ")
}

impl Table {
    /// Render as a pipe table. Text columns align left, numeric columns
    /// align right.
    pub fn to_markdown(&self) -> String {
        let ncols = self.header.len();
        if ncols == 0 {
            return String::new();
        }

        let header: Vec<String> = self.header.iter().map(|h| cell_text(h)).collect();
        let rows: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| {
                (0..ncols)
                    .map(|c| row.get(c).map(|cell| cell_text(cell)).unwrap_or_default())
                    .collect()
            })
            .collect();
        let numeric: Vec<bool> = (0..ncols).map(|c| is_numeric_column(self, c)).collect();

        let widths: Vec<usize> = (0..ncols)
            .map(|c| {
                let head = header[c].chars().count() + 2;
                rows.iter()
                    .map(|row| row[c].chars().count())
                    .fold(head, usize::max)
            })
            .collect();

        let render_row = |cells: &[String]| -> String {
            let padded: Vec<String> = cells
                .iter()
                .enumerate()
                .map(|(c, cell)| {
                    if numeric[c] {
                        format!(" {:>width$} ", cell, width = widths[c])
                    } else {
                        format!(" {:<width$} ", cell, width = widths[c])
                    }
                })
                .collect();
            format!("|{}|", padded.join("|"))
        };

        let separator: Vec<String> = (0..ncols)
            .map(|c| {
                let dashes = "-".repeat(widths[c] + 1);
                if numeric[c] {
                    format!("{}:", dashes)
                } else {
                    format!(":{}", dashes)
                }
            })
            .collect();

        let mut lines = Vec::with_capacity(rows.len() + 2);
        lines.push(render_row(&header));
        lines.push(format!("|{}|", separator.join("|")));
        for row in &rows {
            lines.push(render_row(row));
        }
        lines.join("\n")
    }
}
