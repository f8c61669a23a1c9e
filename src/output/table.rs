#![forbid(unsafe_code)]

use std::io::{self, Write as _};

/// Left-aligned plain-text table, or CSV for scripts.
#[derive(Debug, Default)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn row(&mut self, cols: impl IntoIterator<Item = impl Into<String>>) {
        self.rows.push(cols.into_iter().map(Into::into).collect());
    }

    pub fn print(&self) -> io::Result<()> {
        io::stdout().lock().write_all(self.render().as_bytes())
    }

    pub fn write_csv(&self) -> io::Result<()> {
        let mut wtr = csv::Writer::from_writer(io::stdout().lock());
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()
    }

    #[must_use]
    pub fn render(&self) -> String {
        let columns = self
            .rows
            .iter()
            .map(Vec::len)
            .chain([self.headers.len()])
            .max()
            .unwrap_or(0);
        let mut widths = vec![0usize; columns];
        for row in std::iter::once(&self.headers).chain(&self.rows) {
            for (w, cell) in widths.iter_mut().zip(row) {
                *w = (*w).max(cell.chars().count());
            }
        }

        let mut out = String::new();
        for row in std::iter::once(&self.headers).chain(&self.rows) {
            let mut line = String::new();
            for (i, cell) in row.iter().enumerate() {
                if i > 0 {
                    line.push_str("  ");
                }
                line.push_str(cell);
                let pad = widths[i].saturating_sub(cell.chars().count());
                line.extend(std::iter::repeat_n(' ', pad));
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_columns_and_trims_line_ends() {
        let mut t = Table::new(["TASK", "STATUS", "NAME"]);
        t.row(["3f9a1c2b", "ready", "add a health endpoint"]);
        t.row(["aa", "failed", ""]);
        assert_eq!(
            t.render(),
            "TASK      STATUS  NAME\n3f9a1c2b  ready   add a health endpoint\naa        failed\n"
        );
    }

    #[test]
    fn ragged_rows_do_not_panic() {
        let mut t = Table::new(["A"]);
        t.row(["x", "extra"]);
        assert_eq!(t.render(), "A\nx  extra\n");
    }
}
