use crate::constants::Degree;

/// Split a sexagesimal field such as `17:52:34.51` or `17 52 34.51` in its three parts.
fn split_sexagesimal(value: &str) -> Option<[&str; 3]> {
    let parts: Vec<&str> = value
        .split(|c: char| c == ':' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .collect();
    match parts.as_slice() {
        [a, b, c] => Some([a, b, c]),
        _ => None,
    }
}

/// Estimate the accuracy of a numeric string based on its decimal precision.
///
/// Arguments
/// ---------------
/// * `field`: a string slice containing the numeric value (e.g., `"56.78"`), typically the last component of an angle
/// * `factor`: a scale factor to apply to the accuracy (e.g., `1.0 / 3600.0` for arcseconds)
///
/// Return
/// ----------
/// * the estimated accuracy scaled by `factor`
fn compute_accuracy(field: &str, factor: f64) -> f64 {
    match field.find('.') {
        Some(dot_pos) => {
            let digits_after_dot = field.trim().len() - dot_pos - 1;
            10f64.powi(-(digits_after_dot as i32)) * factor
        }
        None => factor,
    }
}

/// Parse a right ascension string to degrees
///
/// Arguments
/// ---------
/// * `ra`: a string representing the right ascension as `HH:MM:SS.SS` or `HH MM SS.SS`,
///   or directly as decimal degrees
///
/// Returns
/// -------
/// * `Option<(Degree, Degree)>`: the right ascension and its accuracy, both in degrees.
///   Returns `None` if the input format is invalid or out of range.
pub fn parse_ra_to_deg(ra: &str) -> Option<(Degree, Degree)> {
    let Some([h, m, s_raw]) = split_sexagesimal(ra) else {
        let deg: f64 = ra.trim().parse().ok()?;
        return (0.0..360.0).contains(&deg).then_some((deg, 0.0));
    };

    let h: f64 = h.parse().ok()?;
    let m: f64 = m.parse().ok()?;
    let s: f64 = s_raw.parse().ok()?;

    if !(0.0..24.0).contains(&h) || !(0.0..60.0).contains(&m) || !(0.0..60.0).contains(&s) {
        return None;
    }

    let ra_deg = (h + m / 60.0 + s / 3600.0) * 15.0;
    Some((ra_deg, compute_accuracy(s_raw, 15.0 / 3600.0)))
}

/// Parse a declination string to degrees
///
/// Arguments
/// ---------
/// * `dec`: a string representing the declination as `±DD:MM:SS.S` or `±DD MM SS.S`,
///   or directly as decimal degrees
///
/// Returns
/// -------
/// * `Option<(Degree, Degree)>`: the declination and its accuracy, both in degrees.
///   Returns `None` if the input format is invalid or out of range.
pub fn parse_dec_to_deg(dec: &str) -> Option<(Degree, Degree)> {
    let Some([d, m, s_raw]) = split_sexagesimal(dec) else {
        let deg: f64 = dec.trim().parse().ok()?;
        return (-90.0..=90.0).contains(&deg).then_some((deg, 0.0));
    };

    let sign = if d.starts_with('-') { -1.0 } else { 1.0 };
    let d: f64 = d.trim_start_matches(&['-', '+'][..]).parse().ok()?;
    let m: f64 = m.parse().ok()?;
    let s: f64 = s_raw.parse().ok()?;

    let dec_deg = sign * (d + m / 60.0 + s / 3600.0);
    if !(-90.0..=90.0).contains(&dec_deg) {
        return None;
    }
    Some((dec_deg, compute_accuracy(s_raw, 1. / 3600.)))
}
