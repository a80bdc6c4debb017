use serde::{Deserialize, Serialize};
use std::fmt;

/// The four classifier families a game is linked to.
///
/// Every kind has its own dictionary table (`genres`, `tags`, ...) and its own
/// link table (`game_genres`, ...). All table and column names come from this
/// closed set, so they are safe to splice into SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Genre,
    Tag,
    Developer,
    Publisher,
}

impl AttributeKind {
    pub const ALL: [AttributeKind; 4] = [
        AttributeKind::Genre,
        AttributeKind::Tag,
        AttributeKind::Developer,
        AttributeKind::Publisher,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AttributeKind::Genre => "genre",
            AttributeKind::Tag => "tag",
            AttributeKind::Developer => "developer",
            AttributeKind::Publisher => "publisher",
        }
    }

    /// Dictionary table holding `(id, name)` pairs.
    pub fn table(self) -> &'static str {
        match self {
            AttributeKind::Genre => "genres",
            AttributeKind::Tag => "tags",
            AttributeKind::Developer => "developers",
            AttributeKind::Publisher => "publishers",
        }
    }

    pub fn id_column(self) -> &'static str {
        match self {
            AttributeKind::Genre => "genre_id",
            AttributeKind::Tag => "tag_id",
            AttributeKind::Developer => "developer_id",
            AttributeKind::Publisher => "publisher_id",
        }
    }

    pub fn name_column(self) -> &'static str {
        match self {
            AttributeKind::Genre => "genre_name",
            AttributeKind::Tag => "tag_name",
            AttributeKind::Developer => "developer_name",
            AttributeKind::Publisher => "publisher_name",
        }
    }

    /// Link table keyed by `(game_id, <kind>_id)`.
    pub fn link_table(self) -> &'static str {
        match self {
            AttributeKind::Genre => "game_genres",
            AttributeKind::Tag => "game_tags",
            AttributeKind::Developer => "game_developers",
            AttributeKind::Publisher => "game_publishers",
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribute names scraped for one game, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeNames {
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub developers: Vec<String>,
    #[serde(default)]
    pub publishers: Vec<String>,
}

impl AttributeNames {
    pub fn get(&self, kind: AttributeKind) -> &[String] {
        match kind {
            AttributeKind::Genre => &self.genres,
            AttributeKind::Tag => &self.tags,
            AttributeKind::Developer => &self.developers,
            AttributeKind::Publisher => &self.publishers,
        }
    }

    pub fn get_mut(&mut self, kind: AttributeKind) -> &mut Vec<String> {
        match kind {
            AttributeKind::Genre => &mut self.genres,
            AttributeKind::Tag => &mut self.tags,
            AttributeKind::Developer => &mut self.developers,
            AttributeKind::Publisher => &mut self.publishers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_distinct_per_kind() {
        let mut tables: Vec<&str> = AttributeKind::ALL.iter().map(|k| k.table()).collect();
        tables.extend(AttributeKind::ALL.iter().map(|k| k.link_table()));
        tables.sort();
        tables.dedup();
        assert_eq!(tables.len(), 8);
    }

    #[test]
    fn names_accessor_matches_field() {
        let mut names = AttributeNames::default();
        names.get_mut(AttributeKind::Publisher).push("Valve".into());
        assert_eq!(names.publishers, vec!["Valve".to_string()]);
        assert!(names.get(AttributeKind::Developer).is_empty());
    }
}
