//! # Parameter Catalog
//!
//! Immutable table of OBD-II mode 01 parameters and statuses the collector
//! knows how to request, with their display labels and units.
//!
//! The catalog is built once at startup and shared read-only. Sessions copy
//! the entries they need into their own active set.

use std::collections::HashSet;

/// A queryable OBD parameter or status
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Parameter {
    /// Symbolic name (e.g., `RPM`)
    pub name: String,

    /// Request sent to the adapter: mode + PID in hex (e.g., `010C`)
    pub code: String,

    /// Human-readable label used in trip file headers
    pub label: String,

    /// Unit string, empty when unitless
    pub unit: String,
}

impl Parameter {
    /// Create a parameter entry
    pub fn new(name: &str, code: &str, label: &str, unit: &str) -> Self {
        Self {
            name: name.to_string(),
            code: code.to_string(),
            label: label.to_string(),
            unit: unit.to_string(),
        }
    }

    /// Mode byte of the request code
    pub fn mode(&self) -> Option<u8> {
        self.code.get(0..2).and_then(|m| u8::from_str_radix(m, 16).ok())
    }

    /// PID byte of the request code, `None` for mode-only requests
    pub fn pid(&self) -> Option<u8> {
        self.code.get(2..4).and_then(|p| u8::from_str_radix(p, 16).ok())
    }

    /// Header cell for this parameter
    pub fn header_cell(&self) -> String {
        if self.unit.is_empty() {
            self.label.clone()
        } else {
            format!("{} ({})", self.label, self.unit)
        }
    }
}

impl std::fmt::Display for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.name, self.code)
    }
}

// (name, code, label, unit)
const STANDARD_PARAMETERS: &[(&str, &str, &str, &str)] = &[
    ("ENGINE_LOAD", "0104", "Engine load", "%"),
    ("COOLANT_TEMP", "0105", "Coolant temperature", "degC"),
    ("SHORT_FUEL_TRIM_1", "0106", "Short term fuel trim bank 1", "%"),
    ("SHORT_FUEL_TRIM_2", "0108", "Short term fuel trim bank 2", "%"),
    ("LONG_FUEL_TRIM_2", "0109", "Long term fuel trim bank 2", "%"),
    ("FUEL_PRESSURE", "010A", "Fuel pressure", "kPa"),
    ("INTAKE_PRESSURE", "010B", "Intake manifold pressure", "kPa"),
    ("RPM", "010C", "Engine speed", "rpm"),
    ("SPEED", "010D", "Vehicle speed", "km/h"),
    ("TIMING_ADVANCE", "010E", "Timing advance", "deg"),
    ("INTAKE_TEMP", "010F", "Intake air temperature", "degC"),
    ("MAF", "0110", "Air flow rate", "g/s"),
    ("THROTTLE_POS", "0111", "Throttle position", "%"),
    ("AIR_STATUS", "0112", "Secondary air status", ""),
    ("O2_SENSORS", "0113", "O2 sensors present", ""),
    ("O2_B1S1", "0114", "O2 bank 1 sensor 1 voltage", "V"),
    ("O2_B1S2", "0115", "O2 bank 1 sensor 2 voltage", "V"),
    ("O2_B1S3", "0116", "O2 bank 1 sensor 3 voltage", "V"),
    ("O2_B1S4", "0117", "O2 bank 1 sensor 4 voltage", "V"),
    ("O2_B2S1", "0118", "O2 bank 2 sensor 1 voltage", "V"),
    ("O2_B2S2", "0119", "O2 bank 2 sensor 2 voltage", "V"),
    ("O2_B2S3", "011A", "O2 bank 2 sensor 3 voltage", "V"),
    ("O2_B2S4", "011B", "O2 bank 2 sensor 4 voltage", "V"),
    ("OBD_COMPLIANCE", "011C", "OBD standards compliance", ""),
    ("O2_SENSORS_ALT", "011D", "O2 sensors present (alternate)", ""),
    ("AUX_INPUT_STATUS", "011E", "Auxiliary input status", ""),
    ("RUN_TIME", "011F", "Engine run time", "s"),
    ("DISTANCE_W_MIL", "0121", "Distance with MIL on", "km"),
    ("FUEL_RAIL_PRESSURE_VAC", "0122", "Fuel rail pressure (vacuum)", "kPa"),
    ("FUEL_RAIL_PRESSURE_DIRECT", "0123", "Fuel rail pressure (direct)", "kPa"),
    ("O2_S1_WR_VOLTAGE", "0124", "O2 sensor 1 WR lambda voltage", "V"),
    ("O2_S2_WR_VOLTAGE", "0125", "O2 sensor 2 WR lambda voltage", "V"),
    ("O2_S3_WR_VOLTAGE", "0126", "O2 sensor 3 WR lambda voltage", "V"),
    ("O2_S4_WR_VOLTAGE", "0127", "O2 sensor 4 WR lambda voltage", "V"),
    ("O2_S5_WR_VOLTAGE", "0128", "O2 sensor 5 WR lambda voltage", "V"),
    ("O2_S6_WR_VOLTAGE", "0129", "O2 sensor 6 WR lambda voltage", "V"),
    ("O2_S7_WR_VOLTAGE", "012A", "O2 sensor 7 WR lambda voltage", "V"),
    ("O2_S8_WR_VOLTAGE", "012B", "O2 sensor 8 WR lambda voltage", "V"),
    ("COMMANDED_EGR", "012C", "Commanded EGR", "%"),
    ("EGR_ERROR", "012D", "EGR error", "%"),
    ("EVAPORATIVE_PURGE", "012E", "Commanded evaporative purge", "%"),
    ("FUEL_LEVEL", "012F", "Fuel tank level", "%"),
    ("WARMUPS_SINCE_DTC_CLEAR", "0130", "Warm-ups since codes cleared", "count"),
    ("DISTANCE_SINCE_DTC_CLEAR", "0131", "Distance since codes cleared", "km"),
    ("EVAP_VAPOR_PRESSURE", "0132", "Evap system vapor pressure", "Pa"),
    ("BAROMETRIC_PRESSURE", "0133", "Barometric pressure", "kPa"),
    ("O2_S1_WR_CURRENT", "0134", "O2 sensor 1 WR lambda current", "mA"),
    ("O2_S2_WR_CURRENT", "0135", "O2 sensor 2 WR lambda current", "mA"),
    ("O2_S3_WR_CURRENT", "0136", "O2 sensor 3 WR lambda current", "mA"),
    ("O2_S4_WR_CURRENT", "0137", "O2 sensor 4 WR lambda current", "mA"),
    ("O2_S5_WR_CURRENT", "0138", "O2 sensor 5 WR lambda current", "mA"),
    ("O2_S6_WR_CURRENT", "0139", "O2 sensor 6 WR lambda current", "mA"),
    ("O2_S7_WR_CURRENT", "013A", "O2 sensor 7 WR lambda current", "mA"),
    ("O2_S8_WR_CURRENT", "013B", "O2 sensor 8 WR lambda current", "mA"),
    ("CATALYST_TEMP_B1S1", "013C", "Catalyst temperature bank 1 sensor 1", "degC"),
    ("CATALYST_TEMP_B2S1", "013D", "Catalyst temperature bank 2 sensor 1", "degC"),
    ("CATALYST_TEMP_B1S2", "013E", "Catalyst temperature bank 1 sensor 2", "degC"),
    ("CATALYST_TEMP_B2S2", "013F", "Catalyst temperature bank 2 sensor 2", "degC"),
    ("CONTROL_MODULE_VOLTAGE", "0142", "Control module voltage", "V"),
    ("ABSOLUTE_LOAD", "0143", "Absolute load value", "%"),
    ("COMMANDED_EQUIV_RATIO", "0144", "Commanded equivalence ratio", "ratio"),
    ("RELATIVE_THROTTLE_POS", "0145", "Relative throttle position", "%"),
    ("AMBIANT_AIR_TEMP", "0146", "Ambient air temperature", "degC"),
    ("THROTTLE_POS_B", "0147", "Absolute throttle position B", "%"),
    ("THROTTLE_POS_C", "0148", "Absolute throttle position C", "%"),
    ("ACCELERATOR_POS_D", "0149", "Accelerator pedal position D", "%"),
    ("ACCELERATOR_POS_E", "014A", "Accelerator pedal position E", "%"),
    ("ACCELERATOR_POS_F", "014B", "Accelerator pedal position F", "%"),
    ("THROTTLE_ACTUATOR", "014C", "Commanded throttle actuator", "%"),
    ("RUN_TIME_MIL", "014D", "Time run with MIL on", "min"),
    ("TIME_SINCE_DTC_CLEARED", "014E", "Time since codes cleared", "min"),
    ("MAX_MAF", "0150", "Maximum air flow rate", "g/s"),
    ("FUEL_TYPE", "0151", "Fuel type", ""),
    ("ETHANOL_PERCENT", "0152", "Ethanol fuel percent", "%"),
    ("EVAP_VAPOR_PRESSURE_ABS", "0153", "Absolute evap system vapor pressure", "kPa"),
    ("EVAP_VAPOR_PRESSURE_ALT", "0154", "Evap system vapor pressure (alternate)", "Pa"),
    ("SHORT_O2_TRIM_B1", "0155", "Short term secondary O2 trim bank 1", "%"),
    ("LONG_O2_TRIM_B1", "0156", "Long term secondary O2 trim bank 1", "%"),
    ("SHORT_O2_TRIM_B2", "0157", "Short term secondary O2 trim bank 2", "%"),
    ("LONG_O2_TRIM_B2", "0158", "Long term secondary O2 trim bank 2", "%"),
    ("FUEL_RAIL_PRESSURE_ABS", "0159", "Fuel rail absolute pressure", "kPa"),
    ("RELATIVE_ACCEL_POS", "015A", "Relative accelerator pedal position", "%"),
    ("HYBRID_BATTERY_REMAINING", "015B", "Hybrid battery pack remaining life", "%"),
    ("OIL_TEMP", "015C", "Engine oil temperature", "degC"),
    ("FUEL_INJECT_TIMING", "015D", "Fuel injection timing", "deg"),
    ("FUEL_RATE", "015E", "Engine fuel rate", "L/h"),
];

const STANDARD_STATUSES: &[(&str, &str, &str, &str)] = &[
    ("FUEL_STATUS", "0103", "Fuel system status", ""),
    ("AIR_STATUS", "0112", "Secondary air status", ""),
    ("AUX_INPUT_STATUS", "011E", "Auxiliary input status", ""),
];

/// Mode 03: stored diagnostic trouble codes
pub const GET_DTC_CODE: &str = "03";

/// Mode 04: clear diagnostic trouble codes and MIL
pub const CLEAR_DTC_CODE: &str = "04";

/// Read-only parameter and status table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    parameters: Vec<Parameter>,
    statuses: Vec<Parameter>,
}

impl Catalog {
    /// Build a catalog from explicit lists
    pub fn new(parameters: Vec<Parameter>, statuses: Vec<Parameter>) -> Self {
        Self { parameters, statuses }
    }

    /// The standard mode 01 catalog
    pub fn standard() -> Self {
        let build = |rows: &[(&str, &str, &str, &str)]| {
            rows.iter()
                .map(|(name, code, label, unit)| Parameter::new(name, code, label, unit))
                .collect()
        };
        Self::new(build(STANDARD_PARAMETERS), build(STANDARD_STATUSES))
    }

    /// Keep only the named parameters, preserving catalog order
    ///
    /// An empty list keeps everything. Unknown names are returned so the
    /// caller can report them. Statuses are never narrowed.
    pub fn narrowed(&self, names: &[String]) -> (Self, Vec<String>) {
        if names.is_empty() {
            return (self.clone(), Vec::new());
        }

        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        let parameters: Vec<Parameter> = self
            .parameters
            .iter()
            .filter(|p| wanted.contains(p.name.as_str()))
            .cloned()
            .collect();

        let unknown = names
            .iter()
            .filter(|n| self.parameter(n).is_none())
            .cloned()
            .collect();

        (Self::new(parameters, self.statuses.clone()), unknown)
    }

    /// Parameters in catalog order
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Statuses in catalog order
    pub fn statuses(&self) -> &[Parameter] {
        &self.statuses
    }

    /// Look up a parameter by name
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Look up a status by name
    pub fn status(&self, name: &str) -> Option<&Parameter> {
        self.statuses.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_catalog_contents() {
        let catalog = Catalog::standard();
        assert_eq!(catalog.statuses().len(), 3);
        assert!(catalog.parameters().len() > 80);

        let rpm = catalog.parameter("RPM").unwrap();
        assert_eq!(rpm.code, "010C");
        assert_eq!(rpm.mode(), Some(0x01));
        assert_eq!(rpm.pid(), Some(0x0C));
        assert_eq!(rpm.header_cell(), "Engine speed (rpm)");
    }

    #[test]
    fn test_standard_names_are_unique() {
        let catalog = Catalog::standard();
        let names: HashSet<&str> = catalog.parameters().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names.len(), catalog.parameters().len());
    }

    #[test]
    fn test_unitless_header_cell() {
        let status = Catalog::standard().status("FUEL_STATUS").unwrap().clone();
        assert_eq!(status.header_cell(), "Fuel system status");
    }

    #[test]
    fn test_narrowed_preserves_catalog_order() {
        let names = vec!["SPEED".to_string(), "ENGINE_LOAD".to_string(), "BOGUS".to_string()];
        let (narrowed, unknown) = Catalog::standard().narrowed(&names);

        let kept: Vec<&str> = narrowed.parameters().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(kept, vec!["ENGINE_LOAD", "SPEED"]);
        assert_eq!(unknown, vec!["BOGUS".to_string()]);
        assert_eq!(narrowed.statuses().len(), 3);
    }

    #[test]
    fn test_narrowed_with_empty_list_keeps_everything() {
        let catalog = Catalog::standard();
        let (narrowed, unknown) = catalog.narrowed(&[]);
        assert_eq!(narrowed, catalog);
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_mode_only_code_has_no_pid() {
        let dtc = Parameter::new("GET_DTC", GET_DTC_CODE, "Trouble codes", "");
        assert_eq!(dtc.mode(), Some(0x03));
        assert_eq!(dtc.pid(), None);
    }
}
