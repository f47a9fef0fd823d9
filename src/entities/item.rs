use crate::world::position::Position;
use std::collections::BTreeMap;

/// Index into the external item-type catalog. The catalog itself is not owned here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemTypeId(pub u16);

pub const ATTR_ACTION_ID: &str = "aid";
pub const ATTR_UNIQUE_ID: &str = "uid";
pub const ATTR_TEXT: &str = "text";
pub const ATTR_DESCRIPTION: &str = "desc";
pub const ATTR_TELEPORT: &str = "teleport";
pub const ATTR_DEPOT_ID: &str = "depot";
pub const ATTR_DOOR_ID: &str = "door";

/// Deepest container nesting a placed item may carry (see `Item::nesting_depth`).
pub const MAX_CONTAINER_DEPTH: usize = 123;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Int(i32),
    Str(String),
    Position(Position),
}

impl AttributeValue {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            AttributeValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Str(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_position(&self) -> Option<Position> {
        match self {
            AttributeValue::Position(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Str(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Str(value)
    }
}

impl From<Position> for AttributeValue {
    fn from(value: Position) -> Self {
        AttributeValue::Position(value)
    }
}

/// A placed item. Containers own their contents, so nesting is always a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub type_id: ItemTypeId,
    /// Stack count, fluid type or charges, depending on the item type.
    pub count: Option<u16>,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub contents: Vec<Item>,
}

impl Item {
    pub fn new(type_id: u16) -> Self {
        Self {
            type_id: ItemTypeId(type_id),
            count: None,
            attributes: BTreeMap::new(),
            contents: Vec::new(),
        }
    }

    pub fn with_count(type_id: u16, count: u16) -> Self {
        Self {
            count: Some(count),
            ..Self::new(type_id)
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_contents(mut self, contents: Vec<Item>) -> Self {
        self.contents = contents;
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Sets or clears `key`, returning the previous value.
    pub fn set_attribute(
        &mut self,
        key: &str,
        value: Option<AttributeValue>,
    ) -> Option<AttributeValue> {
        match value {
            Some(value) => self.attributes.insert(key.to_string(), value),
            None => self.attributes.remove(key),
        }
    }

    pub fn action_id(&self) -> Option<i32> {
        self.attribute(ATTR_ACTION_ID).and_then(AttributeValue::as_int)
    }

    pub fn text(&self) -> Option<&str> {
        self.attribute(ATTR_TEXT).and_then(AttributeValue::as_str)
    }

    pub fn teleport_destination(&self) -> Option<Position> {
        self.attribute(ATTR_TELEPORT).and_then(AttributeValue::as_position)
    }

    /// True when the item carries nothing beyond its type id.
    pub fn is_plain(&self) -> bool {
        self.count.is_none() && self.attributes.is_empty() && self.contents.is_empty()
    }

    /// This item plus everything nested inside it.
    pub fn total_count(&self) -> usize {
        let mut total = 0;
        let mut stack = vec![self];
        while let Some(item) = stack.pop() {
            total += 1;
            stack.extend(item.contents.iter());
        }
        total
    }

    /// Deepest container nesting below this item (0 for a plain item).
    pub fn nesting_depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 0usize)];
        while let Some((item, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            for child in &item.contents {
                stack.push((child, depth + 1));
            }
        }
        deepest
    }
}
