//! Structural queries over a rendered page snapshot.

use scraper::{ElementRef, Html, Selector};

use crate::error::ScrapeError;

pub struct Document {
    html: Html,
}

impl Document {
    pub fn parse(html: &str) -> Self {
        Self {
            html: Html::parse_document(html),
        }
    }

    /// All matches in document order; fails when nothing matches.
    pub fn select_all(&self, selector: &str) -> Result<Vec<ElementRef<'_>>, ScrapeError> {
        let parsed = parse_selector(selector)?;
        let found: Vec<_> = self.html.select(&parsed).collect();
        if found.is_empty() {
            return Err(ScrapeError::element_not_found(selector));
        }
        Ok(found)
    }

    pub fn table(&self, selector: &str) -> Result<Table, ScrapeError> {
        let table = self.select_all(selector)?[0];
        Table::from_element(table)
    }
}

pub fn parse_selector(selector: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(selector).map_err(|e| ScrapeError::InvalidSelector {
        selector: selector.to_string(),
        reason: format!("{e:?}"),
    })
}

/// First descendant of `element` matching `selector`.
pub fn find_within<'a>(element: ElementRef<'a>, selector: &str) -> Result<ElementRef<'a>, ScrapeError> {
    let parsed = parse_selector(selector)?;
    element
        .select(&parsed)
        .next()
        .ok_or_else(|| ScrapeError::element_not_found(selector))
}

/// Visible text with runs of whitespace collapsed.
pub fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// A rendered HTML table as trimmed cell text, with `colspan` and `rowspan`
/// expanded so every row has one entry per leaf column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// Header path of each leaf column, outermost group first.
    pub columns: Vec<Vec<String>>,
    pub rows: Vec<Vec<String>>,
}

/// Upper bound on a single span attribute.
const MAX_SPAN: usize = 64;

struct Cell {
    text: String,
    colspan: usize,
    rowspan: usize,
}

impl Table {
    fn from_element(table: ElementRef<'_>) -> Result<Self, ScrapeError> {
        let header_rows = parse_selector("thead tr")?;
        let body_rows = parse_selector("tbody tr")?;
        let cells = parse_selector("th, td")?;

        let header: Vec<Vec<Cell>> = table
            .select(&header_rows)
            .map(|row| read_cells(row, &cells))
            .collect();
        if header.is_empty() {
            return Err(ScrapeError::element_not_found("thead tr"));
        }
        let grid = expand_spans(&header);
        let width = grid.iter().map(Vec::len).max().unwrap_or(0);

        let columns = (0..width)
            .map(|col| {
                let mut path: Vec<String> = Vec::new();
                for text in grid.iter().filter_map(|line| line.get(col)) {
                    if !text.is_empty() && path.last() != Some(text) {
                        path.push(text.clone());
                    }
                }
                path
            })
            .collect();

        let body: Vec<Vec<Cell>> = table
            .select(&body_rows)
            .map(|row| read_cells(row, &cells))
            .collect();
        let rows = expand_spans(&body);

        Ok(Self { columns, rows })
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Outermost header of column `index`: the group name for grouped columns.
    pub fn group(&self, index: usize) -> &str {
        self.columns
            .get(index)
            .and_then(|path| path.first())
            .map(String::as_str)
            .unwrap_or("")
    }
}

fn read_cells(row: ElementRef<'_>, cells: &Selector) -> Vec<Cell> {
    row.select(cells)
        .map(|cell| Cell {
            text: text_of(cell),
            colspan: span(cell, "colspan"),
            rowspan: span(cell, "rowspan"),
        })
        .collect()
}

fn span(cell: ElementRef<'_>, name: &str) -> usize {
    cell.value()
        .attr(name)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1)
        .min(MAX_SPAN)
}

/// Lays rows out on a grid, repeating a spanning cell's text in every slot it covers.
fn expand_spans(rows: &[Vec<Cell>]) -> Vec<Vec<String>> {
    // per column: text carried down by a rowspan, and how many rows it still covers
    let mut carried: Vec<(String, usize)> = Vec::new();
    let mut grid = Vec::with_capacity(rows.len());

    for row in rows {
        let mut line: Vec<String> = Vec::new();
        let mut cells = row.iter();
        loop {
            let col = line.len();
            if col < carried.len() && carried[col].1 > 0 {
                carried[col].1 -= 1;
                line.push(carried[col].0.clone());
                continue;
            }
            match cells.next() {
                Some(cell) => {
                    for _ in 0..cell.colspan {
                        let col = line.len();
                        if carried.len() <= col {
                            carried.resize(col + 1, (String::new(), 0));
                        }
                        carried[col] = (cell.text.clone(), cell.rowspan - 1);
                        line.push(cell.text.clone());
                    }
                }
                None if carried.iter().skip(col).any(|c| c.1 > 0) => line.push(String::new()),
                None => break,
            }
        }
        grid.push(line);
    }

    grid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_all_reports_missing_selector() {
        let doc = Document::parse("<div class='a'>x</div>");
        assert_eq!(doc.select_all("div.a").unwrap().len(), 1);
        assert!(matches!(
            doc.select_all("div.b"),
            Err(ScrapeError::ElementNotFound { .. })
        ));
        assert!(matches!(
            doc.select_all("div[["),
            Err(ScrapeError::InvalidSelector { .. })
        ));
    }

    #[test]
    fn test_text_collapses_whitespace() {
        let doc = Document::parse("<p id='t'>  With\n   Open <b>Code</b> </p>");
        let p = doc.select_all("#t").unwrap()[0];
        assert_eq!(text_of(p), "With Open Code");
    }

    #[test]
    fn test_table_uses_last_header_row() {
        let doc = Document::parse(
            r#"<table id="t">
                <thead>
                  <tr><th></th><th colspan="2">Publications</th></tr>
                  <tr><th>KEY</th><th>2023</th><th>2024</th></tr>
                </thead>
                <tbody>
                  <tr><th>OPEN ACCESS</th><td>73</td><td>80</td></tr>
                  <tr><td>PUBLICATIONS</td><td>1,204</td><td>1,310</td></tr>
                </tbody>
               </table>"#,
        );
        let table = doc.table("#t").unwrap();
        assert_eq!(table.width(), 3);
        assert_eq!(table.columns[0], vec!["KEY"]);
        assert_eq!(table.columns[1], vec!["Publications", "2023"]);
        assert_eq!(table.group(2), "Publications");
        assert_eq!(table.rows[0], vec!["OPEN ACCESS", "73", "80"]);
        assert_eq!(table.rows[1][2], "1,310");
    }

    #[test]
    fn test_table_expands_row_and_column_spans() {
        let doc = Document::parse(
            r#"<table id="t">
                <thead>
                  <tr><th rowspan="2">Metric</th><th colspan="2">2023</th><th colspan="2">2024</th></tr>
                  <tr><th>Count</th><th>%</th><th>Count</th><th>%</th></tr>
                </thead>
                <tbody>
                  <tr><td rowspan="2">OPEN ACCESS</td><td>73</td><td>41%</td><td>80</td><td>44%</td></tr>
                  <tr><td>74</td><td>42%</td><td colspan="2">n/a</td></tr>
                </tbody>
               </table>"#,
        );
        let table = doc.table("#t").unwrap();
        assert_eq!(table.width(), 5);
        assert_eq!(table.columns[0], vec!["Metric"]);
        assert_eq!(table.columns[1], vec!["2023", "Count"]);
        assert_eq!(table.columns[4], vec!["2024", "%"]);
        assert_eq!(table.rows[0], vec!["OPEN ACCESS", "73", "41%", "80", "44%"]);
        assert_eq!(table.rows[1], vec!["OPEN ACCESS", "74", "42%", "n/a", "n/a"]);
    }
}
