//! Table detection over PDF page layout.
//!
//! Page content streams are replayed just far enough to know where each
//! text run and each ruling line sits on the page. Two strategies then turn
//! that layout into cell grids:
//!
//! - lattice: cells are the boxes formed by horizontal and vertical ruling lines;
//! - stream: rows come from text baselines, columns from aligned run starts.

use super::table::RawTable;
use super::ExtractError;
use crate::config::TableHeuristics;
use lopdf::content::Content;
use lopdf::{Document, Object};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionStrategy {
    /// Grid-line based.
    Lattice { line_tolerance: f32 },
    /// Whitespace based.
    Stream { row_tol: f32, column_tolerance: f32 },
}

impl DetectionStrategy {
    pub fn lattice(heuristics: &TableHeuristics) -> Self {
        DetectionStrategy::Lattice {
            line_tolerance: heuristics.line_tolerance,
        }
    }

    pub fn stream(heuristics: &TableHeuristics) -> Self {
        DetectionStrategy::Stream {
            row_tol: heuristics.row_tol,
            column_tolerance: heuristics.column_tolerance,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DetectionStrategy::Lattice { .. } => "lattice",
            DetectionStrategy::Stream { .. } => "stream",
        }
    }
}

/// Finds tables on every page of a PDF file.
pub trait TableDetector {
    fn detect(
        &self,
        pdf_path: &Path,
        strategy: &DetectionStrategy,
    ) -> Result<Vec<RawTable>, ExtractError>;
}

/// Detector built on `lopdf` content-stream parsing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LayoutTableDetector;

impl TableDetector for LayoutTableDetector {
    fn detect(
        &self,
        pdf_path: &Path,
        strategy: &DetectionStrategy,
    ) -> Result<Vec<RawTable>, ExtractError> {
        let doc = Document::load(pdf_path)?;
        let mut tables = Vec::new();

        for (page_num, page_id) in doc.get_pages() {
            let layout = match doc
                .get_page_content(page_id)
                .map_err(ExtractError::from)
                .and_then(|bytes| PageLayout::from_content(&bytes))
            {
                Ok(layout) => layout,
                Err(e) => {
                    debug!("skipping page {}: {}", page_num, e);
                    continue;
                }
            };
            let grids = match *strategy {
                DetectionStrategy::Lattice { line_tolerance } => layout.lattice(line_tolerance),
                DetectionStrategy::Stream {
                    row_tol,
                    column_tolerance,
                } => layout.stream(row_tol, column_tolerance),
            };
            debug!(
                "{} strategy found {} tables on page {}",
                strategy.name(),
                grids.len(),
                page_num
            );
            tables.extend(grids.into_iter().map(|grid| RawTable::new(page_num, grid)));
        }
        Ok(tables)
    }
}

type Matrix = [f32; 6];

const IDENTITY: Matrix = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

fn multiply(m: &Matrix, n: &Matrix) -> Matrix {
    [
        m[0] * n[0] + m[1] * n[2],
        m[0] * n[1] + m[1] * n[3],
        m[2] * n[0] + m[3] * n[2],
        m[2] * n[1] + m[3] * n[3],
        m[4] * n[0] + m[5] * n[2] + n[4],
        m[4] * n[1] + m[5] * n[3] + n[5],
    ]
}

fn translate(tx: f32, ty: f32) -> Matrix {
    [1.0, 0.0, 0.0, 1.0, tx, ty]
}

fn apply(m: &Matrix, x: f32, y: f32) -> (f32, f32) {
    (m[0] * x + m[2] * y + m[4], m[1] * x + m[3] * y + m[5])
}

#[derive(Debug, Clone, PartialEq)]
struct TextRun {
    x: f32,
    y: f32,
    text: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    /// y for horizontal lines, x for vertical ones.
    pos: f32,
    start: f32,
    end: f32,
}

#[derive(Debug, Default)]
struct PageLayout {
    runs: Vec<TextRun>,
    horizontal: Vec<Segment>,
    vertical: Vec<Segment>,
}

/// Decode a PDF string operand. UTF-16BE when it carries a BOM, otherwise
/// one byte per character.
fn decode_text(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| b as char).collect()
}

fn numbers(operands: &[Object]) -> Vec<f32> {
    operands.iter().filter_map(|o| o.as_float().ok()).collect()
}

/// Text painted by a Tj/TJ/'/" operand list.
fn shown_text(operator: &str, operands: &[Object]) -> String {
    let target = match operator {
        "\"" => operands.get(2),
        _ => operands.first(),
    };
    match target {
        Some(Object::String(bytes, _)) => decode_text(bytes),
        Some(Object::Array(items)) => {
            let mut text = String::new();
            for item in items {
                match item {
                    Object::String(bytes, _) => text.push_str(&decode_text(bytes)),
                    other => {
                        // Large negative kerning in TJ arrays stands in for a space.
                        if other.as_float().map(|n| n < -250.0).unwrap_or(false) {
                            text.push(' ');
                        }
                    }
                }
            }
            text
        }
        _ => String::new(),
    }
}

struct LayoutBuilder {
    layout: PageLayout,
    ctm: Matrix,
    stack: Vec<Matrix>,
    tm: Matrix,
    tlm: Matrix,
    font_size: f32,
    leading: f32,
    current: Option<(f32, f32)>,
    subpath_start: Option<(f32, f32)>,
}

impl LayoutBuilder {
    fn new() -> Self {
        Self {
            layout: PageLayout::default(),
            ctm: IDENTITY,
            stack: Vec::new(),
            tm: IDENTITY,
            tlm: IDENTITY,
            font_size: 12.0,
            leading: 0.0,
            current: None,
            subpath_start: None,
        }
    }

    fn next_line(&mut self, tx: f32, ty: f32) {
        self.tlm = multiply(&translate(tx, ty), &self.tlm);
        self.tm = self.tlm;
    }

    fn show(&mut self, text: String) {
        let trm = multiply(&self.tm, &self.ctm);
        let (x, y) = apply(&trm, 0.0, 0.0);
        // Glyph widths are unknown without font metrics; half an em per
        // character keeps consecutive runs in order.
        let advance = text.chars().count() as f32 * self.font_size * 0.5;
        self.tm = multiply(&translate(advance, 0.0), &self.tm);
        if !text.trim().is_empty() {
            self.layout.runs.push(TextRun {
                x,
                y,
                text: text.trim().to_string(),
            });
        }
    }

    fn add_segment(&mut self, from: (f32, f32), to: (f32, f32)) {
        let (x0, y0) = from;
        let (x1, y1) = to;
        if (y1 - y0).abs() < 0.5 && (x1 - x0).abs() > 0.5 {
            self.layout.horizontal.push(Segment {
                pos: (y0 + y1) / 2.0,
                start: x0.min(x1),
                end: x0.max(x1),
            });
        } else if (x1 - x0).abs() < 0.5 && (y1 - y0).abs() > 0.5 {
            self.layout.vertical.push(Segment {
                pos: (x0 + x1) / 2.0,
                start: y0.min(y1),
                end: y0.max(y1),
            });
        }
    }

    fn rectangle(&mut self, x: f32, y: f32, w: f32, h: f32) {
        let p0 = apply(&self.ctm, x, y);
        let p1 = apply(&self.ctm, x + w, y + h);
        let (left, right) = (p0.0.min(p1.0), p0.0.max(p1.0));
        let (bottom, top) = (p0.1.min(p1.1), p0.1.max(p1.1));

        // Thin filled rectangles are how many producers draw rules.
        if top - bottom <= 2.0 {
            let mid = (top + bottom) / 2.0;
            self.add_segment((left, mid), (right, mid));
        } else if right - left <= 2.0 {
            let mid = (left + right) / 2.0;
            self.add_segment((mid, bottom), (mid, top));
        } else {
            self.add_segment((left, bottom), (right, bottom));
            self.add_segment((left, top), (right, top));
            self.add_segment((left, bottom), (left, top));
            self.add_segment((right, bottom), (right, top));
        }
    }

    fn operate(&mut self, operator: &str, operands: &[Object]) {
        match operator {
            "q" => self.stack.push(self.ctm),
            "Q" => {
                if let Some(ctm) = self.stack.pop() {
                    self.ctm = ctm;
                }
            }
            "cm" => {
                if let [a, b, c, d, e, f] = numbers(operands)[..] {
                    self.ctm = multiply(&[a, b, c, d, e, f], &self.ctm);
                }
            }
            "BT" => {
                self.tm = IDENTITY;
                self.tlm = IDENTITY;
            }
            "Tf" => {
                if let Some(size) = operands.get(1).and_then(|o| o.as_float().ok()) {
                    self.font_size = size.abs();
                }
            }
            "TL" => {
                if let [leading] = numbers(operands)[..] {
                    self.leading = leading;
                }
            }
            "Td" => {
                if let [tx, ty] = numbers(operands)[..] {
                    self.next_line(tx, ty);
                }
            }
            "TD" => {
                if let [tx, ty] = numbers(operands)[..] {
                    self.leading = -ty;
                    self.next_line(tx, ty);
                }
            }
            "Tm" => {
                if let [a, b, c, d, e, f] = numbers(operands)[..] {
                    self.tlm = [a, b, c, d, e, f];
                    self.tm = self.tlm;
                }
            }
            "T*" => self.next_line(0.0, -self.leading),
            "Tj" | "TJ" => {
                let text = shown_text(operator, operands);
                self.show(text);
            }
            "'" | "\"" => {
                self.next_line(0.0, -self.leading);
                let text = shown_text(operator, operands);
                self.show(text);
            }
            "re" => {
                if let [x, y, w, h] = numbers(operands)[..] {
                    self.rectangle(x, y, w, h);
                }
            }
            "m" => {
                if let [x, y] = numbers(operands)[..] {
                    let point = apply(&self.ctm, x, y);
                    self.current = Some(point);
                    self.subpath_start = Some(point);
                }
            }
            "l" => {
                if let [x, y] = numbers(operands)[..] {
                    let point = apply(&self.ctm, x, y);
                    if let Some(from) = self.current {
                        self.add_segment(from, point);
                    }
                    self.current = Some(point);
                }
            }
            "h" => {
                if let (Some(from), Some(to)) = (self.current, self.subpath_start) {
                    self.add_segment(from, to);
                    self.current = Some(to);
                }
            }
            _ => {}
        }
    }
}

/// Merge sorted positions that lie within `tolerance` of the previous one.
fn cluster(mut values: Vec<f32>, tolerance: f32) -> Vec<f32> {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mut clusters: Vec<Vec<f32>> = Vec::new();
    for v in values {
        match clusters.last_mut() {
            Some(group) if v - group[group.len() - 1] <= tolerance => group.push(v),
            _ => clusters.push(vec![v]),
        }
    }
    clusters
        .into_iter()
        .map(|group| group.iter().sum::<f32>() / group.len() as f32)
        .collect()
}

/// Join the runs that landed in one cell, top to bottom then left to right.
fn cell_text(mut parts: Vec<(f32, f32, String)>) -> String {
    parts.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    });
    parts
        .into_iter()
        .map(|(_, _, text)| text)
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_blank(grid: &[Vec<String>]) -> bool {
    grid.iter().flatten().all(|cell| cell.trim().is_empty())
}

impl PageLayout {
    fn from_content(bytes: &[u8]) -> Result<Self, ExtractError> {
        let content = Content::decode(bytes)?;
        let mut builder = LayoutBuilder::new();
        for op in &content.operations {
            builder.operate(&op.operator, &op.operands);
        }
        Ok(builder.layout)
    }

    fn lattice(&self, tol: f32) -> Vec<Vec<Vec<String>>> {
        let rules: Vec<f32> = self.horizontal.iter().map(|s| s.pos).collect();
        let mut ys = cluster(rules, tol);
        ys.reverse();
        if ys.len() < 2 {
            return Vec::new();
        }

        // Consecutive row boundaries belong to one table while some vertical
        // rule spans the gap between them.
        let mut bands: Vec<Vec<f32>> = Vec::new();
        let mut band = vec![ys[0]];
        for pair in ys.windows(2) {
            let (top, bottom) = (pair[0], pair[1]);
            let connected = self
                .vertical
                .iter()
                .any(|v| v.start <= bottom + tol && v.end >= top - tol);
            if connected {
                band.push(bottom);
            } else {
                bands.push(std::mem::replace(&mut band, vec![bottom]));
            }
        }
        bands.push(band);

        bands
            .into_iter()
            .filter(|band| band.len() >= 2)
            .filter_map(|band| self.lattice_grid(&band, tol))
            .collect()
    }

    fn lattice_grid(&self, ys: &[f32], tol: f32) -> Option<Vec<Vec<String>>> {
        let top = ys[0];
        let bottom = ys[ys.len() - 1];
        let columns: Vec<f32> = self
            .vertical
            .iter()
            .filter(|v| v.start < top - tol && v.end > bottom + tol)
            .map(|v| v.pos)
            .collect();
        let xs = cluster(columns, tol);
        if xs.len() < 2 {
            return None;
        }

        let nrows = ys.len() - 1;
        let ncols = xs.len() - 1;
        let mut cells: Vec<Vec<Vec<(f32, f32, String)>>> = vec![vec![Vec::new(); ncols]; nrows];

        for run in &self.runs {
            if run.y > top + tol || run.y < bottom - tol {
                continue;
            }
            if run.x < xs[0] - tol || run.x > xs[ncols] + tol {
                continue;
            }
            let row = (0..nrows).find(|&r| run.y >= ys[r + 1]).unwrap_or(nrows - 1);
            let col = (0..ncols)
                .rev()
                .find(|&c| run.x >= xs[c] - tol)
                .unwrap_or(0);
            cells[row][col].push((run.y, run.x, run.text.clone()));
        }

        let grid: Vec<Vec<String>> = cells
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect();
        if is_blank(&grid) {
            None
        } else {
            Some(grid)
        }
    }

    fn stream(&self, row_tol: f32, column_tolerance: f32) -> Vec<Vec<Vec<String>>> {
        let mut runs = self.runs.clone();
        runs.sort_by(|a, b| {
            b.y.partial_cmp(&a.y)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.x.partial_cmp(&b.x).unwrap_or(std::cmp::Ordering::Equal))
        });

        let mut rows: Vec<Vec<TextRun>> = Vec::new();
        let mut anchor = f32::INFINITY;
        for run in runs {
            match rows.last_mut() {
                Some(row) if anchor - run.y <= row_tol => row.push(run),
                _ => {
                    anchor = run.y;
                    rows.push(vec![run]);
                }
            }
        }

        // Blocks of consecutive multi-run rows are table candidates.
        let mut blocks: Vec<Vec<Vec<TextRun>>> = Vec::new();
        let mut block: Vec<Vec<TextRun>> = Vec::new();
        for row in rows {
            if row.len() >= 2 {
                block.push(row);
            } else if !block.is_empty() {
                blocks.push(std::mem::take(&mut block));
            }
        }
        if !block.is_empty() {
            blocks.push(block);
        }

        blocks
            .into_iter()
            .filter(|block| block.len() >= 2)
            .filter_map(|block| stream_grid(block, column_tolerance))
            .collect()
    }
}

fn stream_grid(block: Vec<Vec<TextRun>>, tol: f32) -> Option<Vec<Vec<String>>> {
    let mut starts: Vec<f32> = block.iter().flatten().map(|run| run.x).collect();
    starts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mut anchors: Vec<f32> = Vec::new();
    let mut last = f32::NEG_INFINITY;
    for x in starts {
        if x - last > tol {
            anchors.push(x);
        }
        last = x;
    }
    if anchors.len() < 2 {
        return None;
    }

    let grid: Vec<Vec<String>> = block
        .into_iter()
        .map(|row| {
            let mut cells: Vec<Vec<(f32, f32, String)>> = vec![Vec::new(); anchors.len()];
            for run in row {
                let col = anchors
                    .iter()
                    .rposition(|&a| a <= run.x + tol)
                    .unwrap_or(0);
                cells[col].push((run.y, run.x, run.text));
            }
            cells.into_iter().map(cell_text).collect()
        })
        .collect();
    if is_blank(&grid) {
        None
    } else {
        Some(grid)
    }
}
