//! # Record Formatter
//!
//! Builds trip file lines. A formatter is frozen for the lifetime of one
//! trip, so the header and every data row share the same columns:
//!
//! ```text
//! DEVICE_TIME | CAR_ID | TRIP_ID | <active parameters...> | [GPS_LATITUDE .. GPS_SPEED]
//! ```

use crate::catalog::Parameter;
use crate::positioning::{Fix, PositionLabel};

/// Header cell of the time column
pub const DEVICE_TIME_LABEL: &str = "DEVICE_TIME";

/// Time column and trip id format (microsecond resolution)
pub const TIME_FORMAT: &str = "%Y%m%d_%H%M%S-%6f";

/// A label with one value for the whole trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalLabel {
    pub name: String,
    pub value: String,
}

impl GlobalLabel {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// Current local time in the record time format
pub fn device_time() -> String {
    chrono::Local::now().format(TIME_FORMAT).to_string()
}

#[derive(Debug, Clone)]
pub struct RecordFormatter {
    separator: String,
    globals: Vec<GlobalLabel>,
    parameters: Vec<Parameter>,
    positioning: bool,
}

impl RecordFormatter {
    pub fn new(
        separator: &str,
        globals: Vec<GlobalLabel>,
        parameters: Vec<Parameter>,
        positioning: bool,
    ) -> Self {
        Self {
            separator: separator.to_string(),
            globals,
            parameters,
            positioning,
        }
    }

    /// Fields per line, header included
    pub fn column_count(&self) -> usize {
        let position_columns = if self.positioning { PositionLabel::ALL.len() } else { 0 };
        1 + self.globals.len() + self.parameters.len() + position_columns
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn header(&self) -> String {
        let mut cells = Vec::with_capacity(self.column_count());
        cells.push(DEVICE_TIME_LABEL.to_string());
        cells.extend(self.globals.iter().map(|g| g.name.clone()));
        cells.extend(self.parameters.iter().map(Parameter::header_cell));
        if self.positioning {
            cells.extend(PositionLabel::ALL.iter().map(|l| l.header().to_string()));
        }
        self.join(cells)
    }

    /// One data row
    ///
    /// `values` follows the order of the formatter's parameters; missing
    /// entries and absent fix fields become empty cells.
    pub fn data(&self, time: &str, values: &[Option<String>], fix: Option<&Fix>) -> String {
        let mut cells = Vec::with_capacity(self.column_count());
        cells.push(time.to_string());
        cells.extend(self.globals.iter().map(|g| g.value.clone()));
        cells.extend(
            (0..self.parameters.len()).map(|i| values.get(i).cloned().flatten().unwrap_or_default()),
        );
        if self.positioning {
            cells.extend(PositionLabel::ALL.iter().map(|label| {
                fix.and_then(|f| f.get(*label))
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            }));
        }
        self.join(cells)
    }

    fn join(&self, cells: Vec<String>) -> String {
        let mut line = cells
            .iter()
            .map(|cell| self.sanitize(cell))
            .collect::<Vec<_>>()
            .join(&self.separator);
        line.push('\n');
        line
    }

    // A cell must never add a column or a row
    fn sanitize(&self, cell: &str) -> String {
        cell.replace(self.separator.as_str(), " ").replace(['\r', '\n'], " ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    fn two_parameters() -> Vec<Parameter> {
        let catalog = Catalog::standard();
        vec![
            catalog.parameter("RPM").unwrap().clone(),
            catalog.parameter("SPEED").unwrap().clone(),
        ]
    }

    fn globals() -> Vec<GlobalLabel> {
        vec![GlobalLabel::new("CAR_ID", "car-1"), GlobalLabel::new("TRIP_ID", "20240101_120000-000001")]
    }

    fn count_fields(line: &str, separator: &str) -> usize {
        line.trim_end_matches('\n').split(separator).count()
    }

    #[test]
    fn test_header_layout() {
        let formatter = RecordFormatter::new("\t", globals(), two_parameters(), false);
        assert_eq!(
            formatter.header(),
            "DEVICE_TIME\tCAR_ID\tTRIP_ID\tEngine speed (rpm)\tVehicle speed (km/h)\n"
        );
        assert_eq!(formatter.column_count(), 5);
    }

    #[test]
    fn test_data_row_matches_header_width() {
        let formatter = RecordFormatter::new(",", globals(), two_parameters(), false);
        let row = formatter.data("t0", &[Some("1A F8".to_string()), None], None);

        assert_eq!(row, "t0,car-1,20240101_120000-000001,1A F8,\n");
        assert_eq!(count_fields(&row, ","), count_fields(&formatter.header(), ","));
    }

    #[test]
    fn test_positioning_columns() {
        let formatter = RecordFormatter::new("|", globals(), two_parameters(), true);
        assert_eq!(formatter.column_count(), 10);

        let header = formatter.header();
        assert!(header.ends_with("GPS_LATITUDE|GPS_LONGITUDE|GPS_ALTITUDE|GPS_TRACK|GPS_SPEED\n"));

        let fix = Fix {
            latitude: Some(48.5),
            longitude: Some(2.25),
            ..Fix::default()
        };
        let row = formatter.data("t0", &[], Some(&fix));
        assert!(row.ends_with("|48.5|2.25|||\n"));
        assert_eq!(count_fields(&row, "|"), 10);

        let no_fix = formatter.data("t0", &[], None);
        assert_eq!(count_fields(&no_fix, "|"), 10);
    }

    #[test]
    fn test_cells_cannot_break_columns() {
        let formatter = RecordFormatter::new("\t", globals(), two_parameters(), false);
        let row = formatter.data("t0", &[Some("a\tb".to_string()), Some("c\nd".to_string())], None);
        assert_eq!(count_fields(&row, "\t"), 5);
        assert_eq!(row.matches('\n').count(), 1);
    }

    #[test]
    fn test_empty_parameter_set() {
        let formatter = RecordFormatter::new("\t", globals(), Vec::new(), false);
        assert_eq!(formatter.column_count(), 3);
        assert_eq!(formatter.header(), "DEVICE_TIME\tCAR_ID\tTRIP_ID\n");
    }

    #[test]
    fn test_device_time_format() {
        let time = device_time();
        // 20240101_120000-123456
        assert_eq!(time.len(), 22);
        assert_eq!(&time[8..9], "_");
        assert_eq!(&time[15..16], "-");
    }
}
