use crate::config::PaletteConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const RED: Rgb = Rgb::new(255, 0, 0);
    pub const YELLOW: Rgb = Rgb::new(255, 255, 0);
    pub const GREEN: Rgb = Rgb::new(0, 255, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl From<[u8; 3]> for Rgb {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self { r, g, b }
    }
}

/// Three-stop linear gradient over `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorMap {
    pub begin: Rgb,
    pub mid: Rgb,
    pub end: Rgb,
    pub min: f64,
    pub max: f64,
}

/// One palette slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateItem {
    pub color: Rgb,
    pub label: String,
}

/// Number of slots in the significant-digit palette (0% to 100%).
pub const STATE_TABLE_SIZE: usize = 101;

impl ColorMap {
    pub fn new(begin: Rgb, mid: Rgb, end: Rgb, min: f64, max: f64) -> Self {
        Self {
            begin,
            mid,
            end,
            min,
            max,
        }
    }

    /// Red to yellow to green.
    pub fn with_range(min: f64, max: f64) -> Self {
        Self::new(Rgb::RED, Rgb::YELLOW, Rgb::GREEN, min, max)
    }

    pub fn from_palette(palette: &PaletteConfig, min: f64, max: f64) -> Self {
        Self::new(
            palette.begin.into(),
            palette.mid.into(),
            palette.end.into(),
            min,
            max,
        )
    }

    /// Color of `value`. A flat range or a non-finite value maps to `mid`.
    pub fn color_for(&self, value: f64) -> Rgb {
        let span = self.max - self.min;
        if span == 0.0 || !span.is_finite() || !value.is_finite() {
            return self.mid;
        }
        // The midpoint may land a rounding step off 0.5.
        if value == self.min + span / 2.0 || value == (self.min + self.max) / 2.0 {
            return self.mid;
        }
        let p = normalize(self.min, self.max, value);
        if p <= 0.5 {
            lerp(self.begin, self.mid, normalize(0.0, 0.5, p))
        } else {
            lerp(self.mid, self.end, normalize(0.5, 1.0, p))
        }
    }

    /// Palette of `size` slots spread evenly over the gradient, labelled
    /// `0%` upwards.
    pub fn state_table(&self, size: usize) -> Vec<StateItem> {
        let scale = Self {
            min: 0.0,
            max: size.saturating_sub(1) as f64,
            ..*self
        };
        (0..size)
            .map(|i| StateItem {
                color: scale.color_for(i as f64),
                label: format!("{}%", i),
            })
            .collect()
    }
}

impl Default for ColorMap {
    fn default() -> Self {
        Self::with_range(0.0, 100.0)
    }
}

pub fn normalize(min: f64, max: f64, value: f64) -> f64 {
    (value - min) / (max - min)
}

/// Distance under which an interpolation weight counts as an exact stop.
const STOP_SNAP: f64 = 4.0 * f64::EPSILON;

fn lerp(from: Rgb, to: Rgb, t: f64) -> Rgb {
    let t = if t.abs() <= STOP_SNAP {
        0.0
    } else if (1.0 - t).abs() <= STOP_SNAP {
        1.0
    } else {
        t
    };
    let channel = |a: u8, b: u8| -> u8 {
        // `as` truncates toward zero and saturates at the bounds
        (f64::from(b) * t + f64::from(a) * (1.0 - t)) as u8
    };
    Rgb::new(
        channel(from.r, to.r),
        channel(from.g, to.g),
        channel(from.b, to.b),
    )
}

/// Palette slot for a significant-digit sample of a variable of
/// `type_size` bytes. `None` means the sample is not drawn.
pub fn state_index(value: f64, type_size: i32) -> Option<usize> {
    if !value.is_finite() || value < -10.0 {
        return None;
    }
    if value < 0.0 {
        return Some(0);
    }
    let max_digits = match type_size {
        4 => 8.0,
        8 => 17.0,
        _ => return None,
    };
    let index = (normalize(0.0, max_digits, value) * 100.0) as usize;
    Some(index.min(STATE_TABLE_SIZE - 1))
}
