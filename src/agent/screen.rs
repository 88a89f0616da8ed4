//! Immutable screen snapshots.
//!
//! A [`ScreenSnapshot`] is a plain copy of the visible grid of a session's
//! vt100 parser: styled cells, cursor, scroll offset and title. The parser
//! lock is held only for the duration of [`ScreenSnapshot::capture`]; all
//! rendering happens on the copy.

// Rust guideline compliant 2026-02

use std::fmt::Write;

use serde::{Deserialize, Serialize};

/// Terminal color of a cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellColor {
    /// Terminal default color.
    #[default]
    Default,
    /// 256-color palette index.
    Idx(u8),
    /// 24-bit color.
    Rgb(u8, u8, u8),
}

impl From<vt100::Color> for CellColor {
    fn from(color: vt100::Color) -> Self {
        match color {
            vt100::Color::Default => Self::Default,
            vt100::Color::Idx(i) => Self::Idx(i),
            vt100::Color::Rgb(r, g, b) => Self::Rgb(r, g, b),
        }
    }
}

/// Display attributes of a cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellStyle {
    /// Foreground color.
    pub fg: CellColor,
    /// Background color.
    pub bg: CellColor,
    /// Bold.
    pub bold: bool,
    /// Italic.
    pub italic: bool,
    /// Underline.
    pub underline: bool,
    /// Reverse video.
    pub inverse: bool,
}

/// One grid cell. Wide-character continuation cells carry empty text.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    /// Grapheme contents.
    pub text: String,
    /// Display attributes.
    pub style: CellStyle,
}

/// Copy of the visible screen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSnapshot {
    /// Height in rows.
    pub rows: u16,
    /// Width in columns.
    pub cols: u16,
    /// Cursor `(row, col)`.
    pub cursor: (u16, u16),
    /// Whether the application hid the cursor.
    pub cursor_hidden: bool,
    /// Lines the viewport is scrolled back from the live tail (0 = live).
    pub scrollback_offset: usize,
    /// Window title set via OSC 0/2.
    pub title: String,
    /// Grid of `rows` lines with `cols` cells each.
    pub lines: Vec<Vec<Cell>>,
}

impl ScreenSnapshot {
    /// Copies the visible state of a parser screen.
    pub fn capture(screen: &vt100::Screen) -> Self {
        let (rows, cols) = screen.size();
        let mut lines = Vec::with_capacity(rows as usize);

        for row in 0..rows {
            let mut line = Vec::with_capacity(cols as usize);
            for col in 0..cols {
                let cell = screen.cell(row, col).map_or_else(Cell::default, |c| Cell {
                    text: if c.is_wide_continuation() {
                        String::new()
                    } else {
                        c.contents()
                    },
                    style: CellStyle {
                        fg: c.fgcolor().into(),
                        bg: c.bgcolor().into(),
                        bold: c.bold(),
                        italic: c.italic(),
                        underline: c.underline(),
                        inverse: c.inverse(),
                    },
                });
                line.push(cell);
            }
            lines.push(line);
        }

        Self {
            rows,
            cols,
            cursor: screen.cursor_position(),
            cursor_hidden: screen.hide_cursor(),
            scrollback_offset: screen.scrollback(),
            title: screen.title().to_string(),
            lines,
        }
    }

    /// Whether the viewport is away from the live tail.
    pub fn is_scrolled(&self) -> bool {
        self.scrollback_offset > 0
    }

    /// Text of one row with trailing blanks removed.
    pub fn row_text(&self, row: usize) -> String {
        self.lines
            .get(row)
            .map(|line| {
                let text: String = line
                    .iter()
                    .map(|c| if c.text.is_empty() { " " } else { c.text.as_str() })
                    .collect();
                text.trim_end().to_string()
            })
            .unwrap_or_default()
    }

    /// Visible text, one line per row, trailing empty rows dropped.
    pub fn text(&self) -> String {
        let mut rows: Vec<String> = (0..self.lines.len()).map(|r| self.row_text(r)).collect();
        while rows.last().is_some_and(String::is_empty) {
            rows.pop();
        }
        rows.join("\n")
    }

    /// Renders the snapshot as ANSI escape sequences that repaint a terminal.
    ///
    /// Attribute sequences are emitted only when the style changes between
    /// consecutive non-empty cells.
    pub fn to_ansi(&self) -> String {
        let mut out = String::with_capacity(self.rows as usize * self.cols as usize * 4);
        out.push_str("\x1b[?25l\x1b[0m\x1b[2J\x1b[H");

        for (row, line) in self.lines.iter().enumerate() {
            let mut last = CellStyle::default();
            let _ = write!(out, "\x1b[{};1H", row + 1);
            for (col, cell) in line.iter().enumerate() {
                if cell.text.is_empty() {
                    continue;
                }
                let _ = write!(out, "\x1b[{};{}H", row + 1, col + 1);
                if cell.style != last {
                    out.push_str("\x1b[0m");
                    write_color(&mut out, cell.style.fg, true);
                    write_color(&mut out, cell.style.bg, false);
                    if cell.style.bold {
                        out.push_str("\x1b[1m");
                    }
                    if cell.style.italic {
                        out.push_str("\x1b[3m");
                    }
                    if cell.style.underline {
                        out.push_str("\x1b[4m");
                    }
                    if cell.style.inverse {
                        out.push_str("\x1b[7m");
                    }
                    last = cell.style;
                }
                out.push_str(&cell.text);
            }
        }

        out.push_str("\x1b[0m");
        let _ = write!(out, "\x1b[{};{}H", self.cursor.0 + 1, self.cursor.1 + 1);
        if !self.cursor_hidden {
            out.push_str("\x1b[?25h");
        }
        out
    }
}

fn write_color(out: &mut String, color: CellColor, foreground: bool) {
    let base = if foreground { 38 } else { 48 };
    match color {
        CellColor::Default => {}
        CellColor::Idx(i) => {
            let _ = write!(out, "\x1b[{base};5;{i}m");
        }
        CellColor::Rgb(r, g, b) => {
            let _ = write!(out, "\x1b[{base};2;{r};{g};{b}m");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser_with(bytes: &[u8]) -> vt100::Parser {
        let mut parser = vt100::Parser::new(5, 20, 100);
        parser.process(bytes);
        parser
    }

    #[test]
    fn test_capture_dimensions_and_text() {
        let parser = parser_with(b"hello\r\nworld");
        let snap = ScreenSnapshot::capture(parser.screen());

        assert_eq!((snap.rows, snap.cols), (5, 20));
        assert_eq!(snap.lines.len(), 5);
        assert!(snap.lines.iter().all(|l| l.len() == 20));
        assert_eq!(snap.text(), "hello\nworld");
        assert_eq!(snap.cursor, (1, 5));
        assert!(!snap.is_scrolled());
    }

    #[test]
    fn test_capture_styles() {
        let parser = parser_with(b"\x1b[1;31mX\x1b[0mY");
        let snap = ScreenSnapshot::capture(parser.screen());

        let x = &snap.lines[0][0];
        assert_eq!(x.text, "X");
        assert!(x.style.bold);
        assert_eq!(x.style.fg, CellColor::Idx(1));
        assert_eq!(snap.lines[0][1].style, CellStyle::default());
    }

    #[test]
    fn test_snapshot_is_detached_from_parser() {
        let mut parser = parser_with(b"before");
        let snap = ScreenSnapshot::capture(parser.screen());
        parser.process(b"\r\x1b[2Kafter");

        assert_eq!(snap.row_text(0), "before");
        assert_eq!(ScreenSnapshot::capture(parser.screen()).row_text(0), "after");
    }

    #[test]
    fn test_to_ansi_contains_text_and_style() {
        let parser = parser_with(b"\x1b[1mbold\x1b[0m plain");
        let ansi = ScreenSnapshot::capture(parser.screen()).to_ansi();

        assert!(ansi.contains("\x1b[1mb"));
        assert!(ansi.contains("\x1b[1;6Hp") || ansi.contains("\x1b[1;6H\x1b[0mp"));
        assert!(ansi.ends_with("\x1b[?25h"));
    }

    #[test]
    fn test_row_text_out_of_range_is_empty() {
        let parser = parser_with(b"x");
        assert_eq!(ScreenSnapshot::capture(parser.screen()).row_text(99), "");
    }
}
