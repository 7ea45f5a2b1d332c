//! Missing-coordinate synthesis.
//!
//! Some grid products store no latitude or longitude data at all. The coordinate values follow
//! from grid metadata elsewhere in the file, so the builder computes them and embeds them in the
//! manifest instead of recording byte ranges.
//!
//! Three metadata forms are understood, tried in this order:
//!
//! * HDF-EOS2 geographic projection: `eos_projection = "GEO"` with `upleft`, `lowright`, `xdim`
//!   and `ydim` on the variable. Corners are packed degrees-minutes-seconds.
//! * GPM level 3 `GridHeader` text attribute on the file.
//! * Regular grid file attributes (`SW Point Latitude`, `Latitude Step`, `Number of Lines` and
//!   their longitude counterparts).

use crate::error::DmrppError;
use crate::source::Attributes;
use crate::types::ElementType;

/// Variable attribute naming the coordinate a variable holds.
pub const MISSING_COORDINATE_ATTRIBUTE: &str = "missing_coordinate";

/// Coordinate axis of a synthesized variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinateAxis {
    Latitude,
    Longitude,
}

/// Returns the coordinate axis a variable's data must be synthesized for, if any.
///
/// # Arguments
///
/// * `attributes`: Variable attributes
pub fn missing_coordinate(attributes: &Attributes) -> Option<CoordinateAxis> {
    let value = attributes.get(MISSING_COORDINATE_ATTRIBUTE)?.as_text()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "latitude" => Some(CoordinateAxis::Latitude),
        "longitude" => Some(CoordinateAxis::Longitude),
        _ => None,
    }
}

/// Linear coordinate values: `first + i * step` for `count` elements.
#[derive(Clone, Copy, Debug, PartialEq)]
struct LinearAxis {
    first: f64,
    step: f64,
    count: u64,
}

impl LinearAxis {
    fn values(self) -> impl Iterator<Item = f64> {
        (0..self.count).map(move |i| self.first + i as f64 * self.step)
    }
}

/// Compute the values of a missing coordinate variable.
///
/// Returns the values little-endian in the variable's element type.
///
/// # Arguments
///
/// * `variable`: Variable name, for errors
/// * `element_type`: Element type of the variable, `float32` or `float64`
/// * `shape`: Shape of the variable, which must be one-dimensional
/// * `axis`: Coordinate the variable holds
/// * `attributes`: Variable attributes
/// * `root_attributes`: File attributes
pub fn synthesize(
    variable: &str,
    element_type: ElementType,
    shape: &[u64],
    axis: CoordinateAxis,
    attributes: &Attributes,
    root_attributes: &Attributes,
) -> Result<Vec<u8>, DmrppError> {
    let missing = |reason: String| DmrppError::MissingRequiredMetadata {
        variable: variable.to_string(),
        reason,
    };
    let [length] = shape else {
        return Err(DmrppError::UnsupportedLayout {
            variable: variable.to_string(),
            reason: format!("synthesized coordinates must be one-dimensional, not {:?}", shape),
        });
    };
    let is_geo = attributes
        .get("eos_projection")
        .and_then(|value| value.as_text())
        .is_some_and(|projection| projection.trim().eq_ignore_ascii_case("GEO"));
    let linear = if is_geo {
        eos_geographic(axis, attributes).map_err(missing)?
    } else if let Some(header) = root_attributes.get("GridHeader") {
        let header = header
            .as_text()
            .ok_or_else(|| missing("GridHeader is not text".to_string()))?;
        gpm_grid_header(axis, header).map_err(missing)?
    } else {
        regular_grid(axis, root_attributes).map_err(missing)?
    };
    if linear.count != *length {
        return Err(missing(format!(
            "grid metadata describes {} values but the variable has {}",
            linear.count, length
        )));
    }
    match element_type {
        ElementType::Float32 => Ok(linear
            .values()
            .flat_map(|value| (value as f32).to_le_bytes())
            .collect()),
        ElementType::Float64 => Ok(linear.values().flat_map(f64::to_le_bytes).collect()),
        other => Err(DmrppError::UnsupportedElementType {
            variable: variable.to_string(),
            type_name: other.to_string(),
        }),
    }
}

/// Convert packed `DDDMMMSSS.SS` degrees-minutes-seconds to decimal degrees.
fn packed_dms_to_degrees(packed: f64) -> f64 {
    let degrees = (packed / 1e6).trunc();
    let minutes = ((packed - degrees * 1e6) / 1e3).trunc();
    let seconds = packed - degrees * 1e6 - minutes * 1e3;
    degrees + minutes / 60.0 + seconds / 3600.0
}

fn number(attributes: &Attributes, name: &str) -> Result<f64, String> {
    attributes
        .get(name)
        .ok_or_else(|| format!("attribute {} is absent", name))?
        .as_number()
        .ok_or_else(|| format!("attribute {} is not a single number", name))
}

fn pair(attributes: &Attributes, name: &str) -> Result<(f64, f64), String> {
    match attributes
        .get(name)
        .ok_or_else(|| format!("attribute {} is absent", name))?
        .as_numbers()
        .as_deref()
    {
        Some([x, y]) => Ok((*x, *y)),
        _ => Err(format!("attribute {} is not a pair of numbers", name)),
    }
}

fn count(value: f64, name: &str) -> Result<u64, String> {
    if value >= 1.0 && value.fract() == 0.0 {
        Ok(value as u64)
    } else {
        Err(format!("{} must be a positive integer, not {}", name, value))
    }
}

/// HDF-EOS2 geographic projection grid.
fn eos_geographic(axis: CoordinateAxis, attributes: &Attributes) -> Result<LinearAxis, String> {
    let (upleft_lon, upleft_lat) = pair(attributes, "upleft")?;
    let (lowright_lon, lowright_lat) = pair(attributes, "lowright")?;
    let (start, end, size) = match axis {
        CoordinateAxis::Latitude => (upleft_lat, lowright_lat, "ydim"),
        CoordinateAxis::Longitude => (upleft_lon, lowright_lon, "xdim"),
    };
    let n = count(number(attributes, size)?, size)?;
    let start = packed_dms_to_degrees(start);
    let end = packed_dms_to_degrees(end);
    let step = (end - start) / n as f64;
    let corner = attributes
        .get("pixel_registration")
        .and_then(|value| value.as_text())
        .is_some_and(|registration| registration.trim().eq_ignore_ascii_case("corner"));
    let first = if corner { start } else { start + step / 2.0 };
    Ok(LinearAxis {
        first,
        step,
        count: n,
    })
}

/// Returns the value of a `key=value;` line of a grid header.
fn header_value<'a>(line: &'a str, key: &str) -> Result<&'a str, String> {
    let line = line.trim();
    let rest = line
        .strip_prefix(key)
        .ok_or_else(|| format!("GridHeader line {:?} is not {}", line, key))?;
    let value = rest
        .strip_prefix('=')
        .and_then(|value| value.split_once(';'))
        .map(|(value, _)| value.trim())
        .ok_or_else(|| format!("GridHeader {} is not of the form key=value;", key))?;
    Ok(value)
}

fn header_number(line: &str, key: &str) -> Result<f64, String> {
    let value = header_value(line, key)?;
    value
        .parse()
        .map_err(|_| format!("GridHeader {} value {:?} is not a number", key, value))
}

/// GPM level 3 grid from its `GridHeader` attribute.
fn gpm_grid_header(axis: CoordinateAxis, header: &str) -> Result<LinearAxis, String> {
    let lines: Vec<&str> = header.split('\n').collect();
    if lines.len() < 9 {
        return Err(format!("GridHeader has {} lines, at least 9 expected", lines.len()));
    }
    if header_value(lines[1], "Registration")? != "CENTER" {
        return Err("GridHeader registration is not CENTER".to_string());
    }
    let lat_res = header_number(lines[2], "LatitudeResolution")?;
    let lon_res = header_number(lines[3], "LongitudeResolution")?;
    let north = header_number(lines[4], "NorthBoundingCoordinate")?;
    let south = header_number(lines[5], "SouthBoundingCoordinate")?;
    let east = header_number(lines[6], "EastBoundingCoordinate")?;
    let west = header_number(lines[7], "WestBoundingCoordinate")?;
    if header_value(lines[8], "Origin")? != "SOUTHWEST" {
        return Err("GridHeader origin is not SOUTHWEST".to_string());
    }
    let (low, high, resolution) = match axis {
        CoordinateAxis::Latitude => (south, north, lat_res),
        CoordinateAxis::Longitude => (west, east, lon_res),
    };
    if resolution <= 0.0 {
        return Err(format!("GridHeader resolution {} is not positive", resolution));
    }
    let n = count(((high - low) / resolution).round(), "GridHeader grid size")?;
    Ok(LinearAxis {
        first: low + resolution / 2.0,
        step: resolution,
        count: n,
    })
}

/// Returns the first present attribute of several spellings.
fn first_number(attributes: &Attributes, names: &[&str]) -> Result<f64, String> {
    names
        .iter()
        .find(|name| attributes.contains_key(**name))
        .map(|name| number(attributes, name))
        .unwrap_or_else(|| Err(format!("attribute {} is absent", names[0])))
}

/// Regular grid described by south-west point, step and size file attributes.
///
/// Latitude runs north to south.
fn regular_grid(axis: CoordinateAxis, attributes: &Attributes) -> Result<LinearAxis, String> {
    let (swp_names, step_names, count_names): (&[&str], &[&str], &[&str]) = match axis {
        CoordinateAxis::Latitude => (
            &["SW Point Latitude", "sw_point_latitude"],
            &["Latitude Step", "latitude_step"],
            &["Number of Lines", "number_of_lines"],
        ),
        CoordinateAxis::Longitude => (
            &["SW Point Longitude", "sw_point_longitude"],
            &["Longitude Step", "longitude_step"],
            &["Number of Columns", "number_of_columns"],
        ),
    };
    let swp = first_number(attributes, swp_names)?;
    let step = first_number(attributes, step_names)?;
    let n = count(first_number(attributes, count_names)?, count_names[0])?;
    Ok(match axis {
        CoordinateAxis::Latitude => LinearAxis {
            first: swp + (n - 1) as f64 * step,
            step: -step,
            count: n,
        },
        CoordinateAxis::Longitude => LinearAxis {
            first: swp,
            step,
            count: n,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::source::AttributeValue;

    fn attributes(entries: &[(&str, AttributeValue)]) -> Attributes {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    fn text(value: &str) -> AttributeValue {
        AttributeValue::Text(value.to_string())
    }

    fn f64s(bytes: &[u8]) -> Vec<f64> {
        bytes
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes(b.try_into().unwrap()))
            .collect()
    }

    fn f32s(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
            .collect()
    }

    fn lat_variable() -> Attributes {
        attributes(&[(MISSING_COORDINATE_ATTRIBUTE, text("latitude"))])
    }

    fn gpm_header(lines: [&str; 9]) -> Attributes {
        attributes(&[("GridHeader", text(&lines.join("\n")))])
    }

    const GPM_LINES: [&str; 9] = [
        "BinMethod=ARITHMETIC_MEAN;",
        "Registration=CENTER;",
        "LatitudeResolution=0.1;",
        "LongitudeResolution=0.1;",
        "NorthBoundingCoordinate=90;",
        "SouthBoundingCoordinate=-90;",
        "EastBoundingCoordinate=180;",
        "WestBoundingCoordinate=-180;",
        "Origin=SOUTHWEST;",
    ];

    #[test]
    fn missing_coordinate_trigger() {
        assert_eq!(Some(CoordinateAxis::Latitude), missing_coordinate(&lat_variable()));
        let lon = attributes(&[(MISSING_COORDINATE_ATTRIBUTE, text("Longitude"))]);
        assert_eq!(Some(CoordinateAxis::Longitude), missing_coordinate(&lon));
        let other = attributes(&[(MISSING_COORDINATE_ATTRIBUTE, text("time"))]);
        assert_eq!(None, missing_coordinate(&other));
        assert_eq!(None, missing_coordinate(&Attributes::new()));
    }

    #[test]
    fn packed_dms() {
        assert_eq!(-180.0, packed_dms_to_degrees(-180000000.0));
        assert_eq!(90.0, packed_dms_to_degrees(90000000.0));
        assert_eq!(10.5, packed_dms_to_degrees(10030000.0));
        assert_eq!(-0.25, packed_dms_to_degrees(-15000.0));
    }

    #[test]
    fn eos_geographic_latitude_centres() {
        let mut attrs = attributes(&[
            ("eos_projection", text("GEO")),
            ("upleft", AttributeValue::Numbers(vec![-180000000.0, 90000000.0])),
            ("lowright", AttributeValue::Numbers(vec![180000000.0, -90000000.0])),
            ("xdim", AttributeValue::Number(8.0)),
            ("ydim", AttributeValue::Number(4.0)),
        ]);
        attrs.extend(lat_variable());
        let values = synthesize(
            "/lat",
            ElementType::Float64,
            &[4],
            CoordinateAxis::Latitude,
            &attrs,
            &Attributes::new(),
        )
        .unwrap();
        assert_eq!(vec![67.5, 22.5, -22.5, -67.5], f64s(&values));

        attrs.insert("pixel_registration".to_string(), text("corner"));
        let values = synthesize(
            "/lon",
            ElementType::Float32,
            &[8],
            CoordinateAxis::Longitude,
            &attrs,
            &Attributes::new(),
        )
        .unwrap();
        assert_eq!(
            vec![-180.0, -135.0, -90.0, -45.0, 0.0, 45.0, 90.0, 135.0],
            f32s(&values)
        );
    }

    #[test]
    fn eos_geographic_missing_corner() {
        let attrs = attributes(&[
            ("eos_projection", text("GEO")),
            ("upleft", AttributeValue::Numbers(vec![-180000000.0, 90000000.0])),
            ("ydim", AttributeValue::Number(4.0)),
        ]);
        match synthesize(
            "/lat",
            ElementType::Float64,
            &[4],
            CoordinateAxis::Latitude,
            &attrs,
            &Attributes::new(),
        )
        .unwrap_err()
        {
            DmrppError::MissingRequiredMetadata { variable, reason } => {
                assert_eq!("/lat", variable);
                assert!(reason.contains("lowright"), "{reason}");
            }
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn gpm_grid() {
        let root = gpm_header(GPM_LINES);
        let values = synthesize(
            "/lat",
            ElementType::Float32,
            &[1800],
            CoordinateAxis::Latitude,
            &lat_variable(),
            &root,
        )
        .unwrap();
        let values = f32s(&values);
        assert_eq!(1800, values.len());
        assert!((values[0] - -89.95).abs() < 1e-4, "{}", values[0]);
        assert!((values[1799] - 89.95).abs() < 1e-3, "{}", values[1799]);

        let values = synthesize(
            "/lon",
            ElementType::Float64,
            &[3600],
            CoordinateAxis::Longitude,
            &lat_variable(),
            &root,
        )
        .unwrap();
        assert!((f64s(&values)[0] - -179.95).abs() < 1e-9);
    }

    #[test]
    fn gpm_grid_wrong_length() {
        let root = gpm_header(GPM_LINES);
        assert!(matches!(
            synthesize(
                "/lat",
                ElementType::Float32,
                &[180],
                CoordinateAxis::Latitude,
                &lat_variable(),
                &root
            )
            .unwrap_err(),
            DmrppError::MissingRequiredMetadata { .. }
        ));
    }

    #[test]
    fn gpm_grid_corner_registration() {
        let mut lines = GPM_LINES;
        lines[1] = "Registration=CORNER;";
        let err = gpm_grid_header(CoordinateAxis::Latitude, &lines.join("\n")).unwrap_err();
        assert!(err.contains("CENTER"), "{err}");
    }

    #[test]
    fn gpm_grid_short_header() {
        let err = gpm_grid_header(CoordinateAxis::Latitude, &GPM_LINES[..8].join("\n")).unwrap_err();
        assert!(err.contains("at least 9"), "{err}");
    }

    #[test]
    fn gpm_grid_malformed_value() {
        let mut lines = GPM_LINES;
        lines[2] = "LatitudeResolution 0.1";
        let err = gpm_grid_header(CoordinateAxis::Latitude, &lines.join("\n")).unwrap_err();
        assert!(err.contains("key=value"), "{err}");
    }

    #[test]
    fn regular_grid_latitude_runs_north_to_south() {
        let root = attributes(&[
            ("SW Point Latitude", AttributeValue::Number(-89.5)),
            ("Latitude Step", AttributeValue::Number(1.0)),
            ("Number of Lines", AttributeValue::Number(180.0)),
        ]);
        let values = synthesize(
            "/lat",
            ElementType::Float64,
            &[180],
            CoordinateAxis::Latitude,
            &lat_variable(),
            &root,
        )
        .unwrap();
        let values = f64s(&values);
        assert_eq!(89.5, values[0]);
        assert_eq!(88.5, values[1]);
        assert_eq!(-89.5, values[179]);
    }

    #[test]
    fn regular_grid_lowercase_longitude() {
        let root = attributes(&[
            ("sw_point_longitude", text("-179.5")),
            ("longitude_step", AttributeValue::Number(1.0)),
            ("number_of_columns", AttributeValue::Number(360.0)),
        ]);
        let values = synthesize(
            "/lon",
            ElementType::Float32,
            &[360],
            CoordinateAxis::Longitude,
            &lat_variable(),
            &root,
        )
        .unwrap();
        let values = f32s(&values);
        assert_eq!(-179.5, values[0]);
        assert_eq!(179.5, values[359]);
    }

    #[test]
    fn regular_grid_zero_lines() {
        let root = attributes(&[
            ("SW Point Latitude", AttributeValue::Number(-89.5)),
            ("Latitude Step", AttributeValue::Number(1.0)),
            ("Number of Lines", AttributeValue::Number(0.0)),
        ]);
        assert!(matches!(
            synthesize(
                "/lat",
                ElementType::Float64,
                &[180],
                CoordinateAxis::Latitude,
                &lat_variable(),
                &root
            )
            .unwrap_err(),
            DmrppError::MissingRequiredMetadata { .. }
        ));
    }

    #[test]
    fn no_metadata() {
        match synthesize(
            "/lat",
            ElementType::Float64,
            &[10],
            CoordinateAxis::Latitude,
            &lat_variable(),
            &Attributes::new(),
        )
        .unwrap_err()
        {
            DmrppError::MissingRequiredMetadata { reason, .. } => {
                assert!(reason.contains("SW Point Latitude"), "{reason}")
            }
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn integer_coordinates_unsupported() {
        let root = attributes(&[
            ("SW Point Latitude", AttributeValue::Number(0.0)),
            ("Latitude Step", AttributeValue::Number(1.0)),
            ("Number of Lines", AttributeValue::Number(2.0)),
        ]);
        assert!(matches!(
            synthesize(
                "/lat",
                ElementType::Int32,
                &[2],
                CoordinateAxis::Latitude,
                &lat_variable(),
                &root
            )
            .unwrap_err(),
            DmrppError::UnsupportedElementType { .. }
        ));
    }

    #[test]
    fn two_dimensional_unsupported() {
        assert!(matches!(
            synthesize(
                "/lat",
                ElementType::Float32,
                &[2, 2],
                CoordinateAxis::Latitude,
                &lat_variable(),
                &Attributes::new()
            )
            .unwrap_err(),
            DmrppError::UnsupportedLayout { .. }
        ));
    }
}
