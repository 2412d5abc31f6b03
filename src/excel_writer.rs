use anyhow::Result;
use rust_xlsxwriter::{Color, Format, FormatBorder, Workbook};
use std::path::Path;

use crate::models::{ExportBatch, MetricRecord, ValueKind};

/// Workbook of every record exported during one run.
pub struct ExcelExporter {
    workbook: Workbook,
    next_row: u32,
}

const VALUE_COLUMN: u16 = 6;

impl ExcelExporter {
    pub fn new() -> Result<Self> {
        let mut workbook = Workbook::new();
        let worksheet = workbook.add_worksheet();
        worksheet.set_name("records")?;

        // Header: navy background, bold, white font
        let header_format = Format::new()
            .set_bold()
            .set_background_color(Color::RGB(0x000080))
            .set_font_color(Color::White)
            .set_border(FormatBorder::Thin);

        for (col, header) in MetricRecord::HEADER.iter().enumerate() {
            worksheet.write_with_format(0, col as u16, *header, &header_format)?;
        }

        let widths = [22.0, 12.0, 10.0, 16.0, 16.0, 40.0, 14.0, 12.0, 50.0, 22.0];
        for (col, width) in widths.into_iter().enumerate() {
            worksheet.set_column_width(col as u16, width)?;
        }
        worksheet.set_freeze_panes(1, 0)?;

        Ok(Self { workbook, next_row: 1 })
    }

    pub fn write_batch(&mut self, batch: &ExportBatch) -> Result<()> {
        let worksheet = self.workbook.worksheet_from_index(0)?;

        let cell_format = Format::new().set_border(FormatBorder::Thin);
        let percent_format = Format::new()
            .set_border(FormatBorder::Thin)
            .set_num_format("0.0\"%\"");
        let count_format = Format::new()
            .set_border(FormatBorder::Thin)
            .set_num_format("#,##0");
        let amount_format = Format::new()
            .set_border(FormatBorder::Thin)
            .set_num_format("#,##0.00");

        for record in &batch.records {
            let row = self.next_row;
            for (col, value) in record.to_row().iter().enumerate() {
                if col as u16 != VALUE_COLUMN {
                    worksheet.write_with_format(row, col as u16, value.as_str(), &cell_format)?;
                }
            }

            // Numbers stay numeric so the sheet can chart them
            match (record.metric_value.as_number(), record.value_kind) {
                (Some(n), ValueKind::Percentage) => {
                    worksheet.write_with_format(row, VALUE_COLUMN, n, &percent_format)?;
                }
                (Some(n), _) if n.fract() == 0.0 => {
                    worksheet.write_with_format(row, VALUE_COLUMN, n, &count_format)?;
                }
                (Some(n), _) => {
                    worksheet.write_with_format(row, VALUE_COLUMN, n, &amount_format)?;
                }
                (None, _) => {
                    let text = record.metric_value.to_string();
                    worksheet.write_with_format(row, VALUE_COLUMN, text.as_str(), &cell_format)?;
                }
            }

            self.next_row += 1;
        }

        Ok(())
    }

    pub fn rows_written(&self) -> u32 {
        self.next_row - 1
    }

    pub fn save(mut self, path: &Path) -> Result<()> {
        self.workbook.save(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Environment, MetricValue, Section, TimeWindow};
    use chrono::{NaiveDate, Utc};

    #[test]
    fn test_writes_all_batches_to_one_workbook() {
        let record = MetricRecord {
            organisation: "hhmi".to_string(),
            environment: Environment::Dev,
            section: Section::Insights,
            time_window: TimeWindow::AllTime,
            time_window_start: None,
            time_window_end: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            metric_name: "With Open Code".to_string(),
            metric_value: MetricValue::Number(42.0),
            value_kind: ValueKind::Percentage,
            source_url: "https://dev.oa.report/hhmi".to_string(),
            collected_at: Utc::now(),
        };
        let mut unparsed = record.clone();
        unparsed.metric_value = MetricValue::Text("N/A".to_string());
        unparsed.value_kind = ValueKind::Unparsed;
        let batch = ExportBatch {
            organisation: "hhmi".to_string(),
            environment: Environment::Dev,
            section: Section::Insights,
            records: vec![record, unparsed],
        };

        let mut excel = ExcelExporter::new().unwrap();
        excel.write_batch(&batch).unwrap();
        excel.write_batch(&batch).unwrap();
        assert_eq!(excel.rows_written(), 4);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.xlsx");
        excel.save(&path).unwrap();
        assert!(path.metadata().unwrap().len() > 0);
    }
}
