use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Tag name rules: ASCII letters, digits, `_` and `-`, starting with a letter
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TagError {
    #[error("tag name cannot be empty")]
    Empty,
    #[error("tag name must start with a letter, found '{0}'")]
    InvalidStart(char),
    #[error("tag name contains invalid character '{0}'")]
    InvalidCharacter(char),
}

pub fn validate_tag_name(name: &str) -> Result<(), TagError> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err(TagError::Empty),
        Some(first) if !first.is_ascii_alphabetic() => return Err(TagError::InvalidStart(first)),
        Some(_) => {}
    }
    match chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-')) {
        Some(bad) => Err(TagError::InvalidCharacter(bad)),
        None => Ok(()),
    }
}

/// Tag to node ids. Stored as the content of the tag snapshot blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagIndex {
    content: BTreeMap<String, BTreeSet<String>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Tag a node; every name is validated before anything changes
    pub fn add(&mut self, id: &str, tags: &[&str]) -> Result<(), TagError> {
        for tag in tags {
            validate_tag_name(tag)?;
        }
        for tag in tags {
            self.content
                .entry(tag.to_string())
                .or_default()
                .insert(id.to_string());
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &str, tags: &[&str]) {
        for tag in tags {
            if let Some(ids) = self.content.get_mut(*tag) {
                ids.remove(id);
                if ids.is_empty() {
                    self.content.remove(*tag);
                }
            }
        }
    }

    /// Drop a node from every tag
    pub fn forget(&mut self, id: &str) {
        self.content.retain(|_, ids| {
            ids.remove(id);
            !ids.is_empty()
        });
    }

    /// `"tag (count)"` for every tag, sorted by tag
    pub fn list(&self) -> Vec<String> {
        self.content
            .iter()
            .map(|(tag, ids)| format!("{} ({})", tag, ids.len()))
            .collect()
    }

    /// Sorted tags carried by a node
    pub fn tags_of(&self, id: &str) -> Vec<&str> {
        self.content
            .iter()
            .filter(|(_, ids)| ids.contains(id))
            .map(|(tag, _)| tag.as_str())
            .collect()
    }

    /// Ids carrying every one of `tags`
    pub fn ids_with_all(&self, tags: &[&str]) -> BTreeSet<String> {
        let mut sets = tags.iter().map(|t| self.content.get(*t));
        let Some(Some(first)) = sets.next() else {
            return BTreeSet::new();
        };
        let mut ids = first.clone();
        for set in sets {
            match set {
                Some(set) => ids.retain(|id| set.contains(id)),
                None => return BTreeSet::new(),
            }
        }
        ids
    }

    pub fn contains_tag(&self, tag: &str, id: &str) -> bool {
        self.content.get(tag).is_some_and(|ids| ids.contains(id))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tag_name_rules() {
        assert!(validate_tag_name("web").is_ok());
        assert!(validate_tag_name("w3_b-x").is_ok());
        assert_eq!(validate_tag_name(""), Err(TagError::Empty));
        assert_eq!(validate_tag_name("7up"), Err(TagError::InvalidStart('7')));
        assert_eq!(
            validate_tag_name("we b"),
            Err(TagError::InvalidCharacter(' '))
        );
    }

    #[test]
    fn test_add_list_remove() {
        let mut tags = TagIndex::new();
        tags.add("aaaa", &["web"]).unwrap();
        tags.add("bbbb", &["web", "wob"]).unwrap();
        tags.add("cccc", &["wib", "wob"]).unwrap();
        assert_eq!(tags.list(), vec!["web (2)", "wib (1)", "wob (2)"]);

        tags.remove("bbbb", &["web"]);
        assert_eq!(tags.list(), vec!["web (1)", "wib (1)", "wob (2)"]);
        assert_eq!(tags.tags_of("cccc"), vec!["wib", "wob"]);

        let both = tags.ids_with_all(&["wob", "wib"]);
        assert_eq!(both.into_iter().collect::<Vec<_>>(), vec!["cccc"]);
        assert!(tags.ids_with_all(&["nope"]).is_empty());
    }

    #[test]
    fn test_invalid_tag_changes_nothing() {
        let mut tags = TagIndex::new();
        assert!(tags.add("aaaa", &["ok", "-bad"]).is_err());
        assert!(tags.is_empty());
    }

    #[test]
    fn test_forget_and_json() {
        let mut tags = TagIndex::new();
        tags.add("aaaa", &["web", "mail"]).unwrap();
        tags.add("bbbb", &["web"]).unwrap();
        tags.forget("aaaa");
        assert_eq!(tags.list(), vec!["web (1)"]);

        let json = tags.to_json().unwrap();
        assert_eq!(TagIndex::from_json(&json).unwrap(), tags);
    }
}
