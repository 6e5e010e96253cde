//! Fixed bench calibration for the handpiece motor.
//!
//! Operators think in RPM and sweep angles; the controller wants PWM duty
//! values and millisecond timings. Every conversion here is a table lookup
//! against data measured once on the bench, so all functions are pure.
//! Callers clamp numeric input before calling in.

use thiserror::Error;
use tracing::error;

/// One measured (rpm, pwm) correspondence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    pub rpm: u32,
    pub pwm: u8,
}

const fn mark(rpm: u32, pwm: u8) -> Mark {
    Mark { rpm, pwm }
}

pub const SPEED_COUNT: usize = 19;
pub const ANGLE_COUNT: usize = 10;

/// Ordered by RPM. Nearest-match ties go to the earlier entry, so the order
/// is part of the contract.
pub const MARKS: [Mark; SPEED_COUNT] = [
    mark(500, 8),
    mark(750, 16),
    mark(1000, 24),
    mark(1250, 31),
    mark(1500, 39),
    mark(1750, 47),
    mark(2000, 55),
    mark(2250, 63),
    mark(2500, 72),
    mark(2750, 80),
    mark(3000, 89),
    mark(3500, 104),
    mark(4000, 120),
    mark(4500, 137),
    mark(5000, 153),
    mark(5500, 170),
    mark(6000, 188),
    mark(6500, 210),
    mark(7000, 232),
];

/// Sweep angles in degrees with a calibrated timing.
pub const ANGLES: [u32; ANGLE_COUNT] = [30, 45, 60, 90, 120, 150, 180, 210, 270, 360];

/// Milliseconds per sweep, rows follow `MARKS`, columns follow `ANGLES`.
const MATRIX: [[u32; ANGLE_COUNT]; SPEED_COUNT] = [
    [23, 28, 33, 43, 53, 63, 73, 83, 103, 133],
    [20, 24, 27, 34, 40, 47, 54, 60, 74, 94],
    [19, 22, 24, 29, 34, 39, 44, 49, 59, 74],
    [18, 20, 22, 26, 30, 34, 38, 42, 50, 62],
    [18, 20, 22, 25, 28, 32, 35, 38, 45, 55],
    [18, 20, 21, 24, 27, 30, 33, 36, 41, 50],
    [18, 20, 21, 24, 26, 28, 31, 34, 38, 46],
    [19, 20, 21, 23, 25, 28, 30, 32, 36, 43],
    [19, 20, 21, 23, 25, 27, 29, 31, 35, 41],
    [19, 20, 21, 23, 25, 27, 28, 30, 34, 39],
    [20, 20, 21, 23, 25, 26, 28, 30, 33, 38],
    [20, 21, 22, 23, 25, 26, 28, 29, 32, 36],
    [21, 22, 22, 24, 25, 26, 28, 29, 31, 35],
    [22, 23, 23, 24, 25, 27, 28, 29, 31, 34],
    [23, 24, 24, 25, 26, 27, 28, 29, 31, 34],
    [24, 24, 25, 26, 27, 28, 28, 29, 31, 34],
    [25, 25, 26, 26, 27, 28, 29, 30, 32, 34],
    [26, 26, 27, 27, 28, 29, 30, 30, 32, 34],
    [27, 27, 27, 28, 29, 30, 30, 31, 32, 35],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CalibrationLookupError {
    #[error("no calibration row for {rpm} rpm")]
    UnknownRpm { rpm: u32 },
    #[error("no calibration column for {angle} degrees")]
    UnknownAngle { angle: u32 },
}

fn speed_index(rpm: u32) -> Option<usize> {
    MARKS.iter().position(|m| m.rpm == rpm)
}

fn angle_index(angle: u32) -> Option<usize> {
    ANGLES.iter().position(|a| *a == angle)
}

pub fn ms_for_calibration(rpm: u32, angle: u32) -> Result<u32, CalibrationLookupError> {
    let speed = speed_index(rpm).ok_or(CalibrationLookupError::UnknownRpm { rpm })?;
    let column = angle_index(angle).ok_or(CalibrationLookupError::UnknownAngle { angle })?;
    Ok(MATRIX[speed][column])
}

/// Degraded form of [`ms_for_calibration`]: a miss is logged and yields 0.
pub fn ms_for_calibration_or_zero(rpm: u32, angle: u32) -> u32 {
    match ms_for_calibration(rpm, angle) {
        Ok(ms) => ms,
        Err(err) => {
            error!(rpm, angle, %err, "calibration: lookup miss, using 0 ms");
            0
        }
    }
}

pub fn nearest_pwm_for_rpm(rpm: u32) -> u8 {
    nearest_pwm_in(&MARKS, rpm)
}

pub fn nearest_rpm_for_pwm(pwm: u8) -> u32 {
    nearest_rpm_in(&MARKS, pwm)
}

/// Left-to-right scan; only a strictly smaller distance replaces the best,
/// so the first of two equidistant marks wins. Empty input maps to 0.
pub fn nearest_pwm_in(marks: &[Mark], rpm: u32) -> u8 {
    nearest_by(marks, |m| m.rpm.abs_diff(rpm)).map_or(0, |m| m.pwm)
}

pub fn nearest_rpm_in(marks: &[Mark], pwm: u8) -> u32 {
    nearest_by(marks, |m| m.pwm.abs_diff(pwm) as u32).map_or(0, |m| m.rpm)
}

fn nearest_by(marks: &[Mark], distance: impl Fn(&Mark) -> u32) -> Option<&Mark> {
    let mut best: Option<(&Mark, u32)> = None;
    for candidate in marks {
        let d = distance(candidate);
        match best {
            Some((_, best_d)) if d >= best_d => {}
            _ => best = Some((candidate, d)),
        }
    }
    best.map(|(m, _)| m)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
