//! Profiling categories for label frames and markers.
//!
//! The set is fixed at build time; the emitter writes it into the document's
//! `meta.categories` array and frames/markers reference entries by index.

use serde::ser::{Serialize, SerializeMap, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Category {
    Idle = 0,
    #[default]
    Other = 1,
    Io = 2,
    Scheduling = 3,
    Runtime = 4,
}

pub(crate) const CATEGORIES: &[Category] = &[
    Category::Idle,
    Category::Other,
    Category::Io,
    Category::Scheduling,
    Category::Runtime,
];

impl Category {
    pub(crate) fn from_u8(value: u8) -> Category {
        match value {
            0 => Category::Idle,
            2 => Category::Io,
            3 => Category::Scheduling,
            4 => Category::Runtime,
            _ => Category::Other,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Category::Idle => "Idle",
            Category::Other => "Other",
            Category::Io => "IO",
            Category::Scheduling => "Scheduling",
            Category::Runtime => "Runtime",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Category::Idle => "transparent",
            Category::Other => "grey",
            Category::Io => "blue",
            Category::Scheduling => "purple",
            Category::Runtime => "orange",
        }
    }
}

impl Serialize for Category {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("name", self.name())?;
        map.serialize_entry("color", self.color())?;
        map.serialize_entry("subcategories", &["Other"])?;
        map.end()
    }
}
