use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};
use std::{fmt, str::FromStr};

/// The three work pipelines a monitor moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pipeline {
    Pulse,
    Intervention,
    Code,
}

impl Pipeline {
    pub const ALL: [Pipeline; 3] = [Pipeline::Pulse, Pipeline::Intervention, Pipeline::Code];

    pub fn as_str(&self) -> &'static str {
        match self {
            Pipeline::Pulse => "pulse",
            Pipeline::Intervention => "intervention",
            Pipeline::Code => "code",
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per pipeline, indexable by [`Pipeline`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Pipelines<T> {
    pub pulse: T,
    pub intervention: T,
    pub code: T,
}

impl<T> Pipelines<T> {
    pub fn from_fn(mut f: impl FnMut(Pipeline) -> T) -> Self {
        Self {
            pulse: f(Pipeline::Pulse),
            intervention: f(Pipeline::Intervention),
            code: f(Pipeline::Code),
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(Pipeline, &T) -> U) -> Pipelines<U> {
        Pipelines {
            pulse: f(Pipeline::Pulse, &self.pulse),
            intervention: f(Pipeline::Intervention, &self.intervention),
            code: f(Pipeline::Code, &self.code),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Pipeline, &T)> {
        [
            (Pipeline::Pulse, &self.pulse),
            (Pipeline::Intervention, &self.intervention),
            (Pipeline::Code, &self.code),
        ]
        .into_iter()
    }
}

impl<T> Index<Pipeline> for Pipelines<T> {
    type Output = T;

    fn index(&self, pipeline: Pipeline) -> &T {
        match pipeline {
            Pipeline::Pulse => &self.pulse,
            Pipeline::Intervention => &self.intervention,
            Pipeline::Code => &self.code,
        }
    }
}

impl<T> IndexMut<Pipeline> for Pipelines<T> {
    fn index_mut(&mut self, pipeline: Pipeline) -> &mut T {
        match pipeline {
            Pipeline::Pulse => &mut self.pulse,
            Pipeline::Intervention => &mut self.intervention,
            Pipeline::Code => &mut self.code,
        }
    }
}

/// Alert colors. Declaration order is also dispatch priority when several
/// colors are waiting on the same monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Red,
    Yellow,
    Cyan,
    #[serde(alias = "grey")]
    Gray,
    Green,
}

impl Color {
    pub const ALL: [Color; 5] = [Color::Red, Color::Yellow, Color::Cyan, Color::Gray, Color::Green];

    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Red => "red",
            Color::Yellow => "yellow",
            Color::Cyan => "cyan",
            Color::Gray => "gray",
            Color::Green => "green",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn bit(self) -> u8 {
        1 << self.index()
    }
}

impl FromStr for Color {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "red" => Ok(Color::Red),
            "yellow" => Ok(Color::Yellow),
            "cyan" => Ok(Color::Cyan),
            "gray" | "grey" => Ok(Color::Gray),
            "green" => Ok(Color::Green),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-size per-color table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColorMap<T>([T; 5]);

impl<T> ColorMap<T> {
    pub fn from_fn(mut f: impl FnMut(Color) -> T) -> Self {
        Self(Color::ALL.map(&mut f))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Color, &T)> {
        Color::ALL.into_iter().zip(self.0.iter())
    }
}

impl<T> Index<Color> for ColorMap<T> {
    type Output = T;

    fn index(&self, color: Color) -> &T {
        &self.0[color.index()]
    }
}

impl<T> IndexMut<Color> for ColorMap<T> {
    fn index_mut(&mut self, color: Color) -> &mut T {
        &mut self.0[color.index()]
    }
}

/// Compact set of colors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColorSet(u8);

impl ColorSet {
    pub fn insert(&mut self, color: Color) -> bool {
        let had = self.contains(color);
        self.0 |= color.bit();
        !had
    }

    pub fn remove(&mut self, color: Color) -> bool {
        let had = self.contains(color);
        self.0 &= !color.bit();
        had
    }

    pub fn contains(&self, color: Color) -> bool {
        self.0 & color.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Colors in priority order.
    pub fn iter(&self) -> impl Iterator<Item = Color> + '_ {
        Color::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PulseKind {
    Http,
    Tcp,
    Icmp,
}

impl fmt::Display for PulseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PulseKind::Http => "http",
            PulseKind::Tcp => "tcp",
            PulseKind::Icmp => "icmp",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Script,
    Docker,
    Webhook,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format!("{self:?}").to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    Log,
    Webhook,
    Email,
    Slack,
    Pagerduty,
}

impl fmt::Display for NotifyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format!("{self:?}").to_lowercase())
    }
}
