//! Checked views over decoded nodes
//!
//! A `Field` knows nothing about the node it wraps until an accessor is
//! called. Every accessor checks the tag and arity it expects and fails
//! with a malformed-message error otherwise.

use std::collections::BTreeMap;

use super::error::{ProtocolError, ProtocolResult};
use super::tree::*;
use crate::types::{Authority, AuthorityKind};

#[derive(Debug, Clone, Copy)]
pub struct Field<'a> {
	node: &'a Node,
}

/// One `LE` entry of a list
#[derive(Debug, Clone)]
pub enum ListElement<'a> {
	Single(Field<'a>),
	Multiple(Vec<Field<'a>>),
}

impl<'a> ListElement<'a> {
	pub fn single(&self) -> ProtocolResult<Field<'a>> {
		match self {
			ListElement::Single(field) => Ok(*field),
			ListElement::Multiple(_) => {
				Err(ProtocolError::malformed("expected a single-field list element"))
			}
		}
	}

	/// Fields of the element; a single-field element yields one field
	pub fn fields(&self) -> Vec<Field<'a>> {
		match self {
			ListElement::Single(field) => vec![*field],
			ListElement::Multiple(fields) => fields.clone(),
		}
	}
}

fn mismatch(expected: &str, node: &Node) -> ProtocolError {
	match node.tag() {
		Some(tag) => ProtocolError::malformed(format!("expected '{}' field, got '{}'", expected, tag)),
		None => ProtocolError::malformed(format!("expected '{}' field, got a terminal value", expected)),
	}
}

impl<'a> Field<'a> {
	pub fn new(node: &'a Node) -> Self {
		Field { node }
	}

	pub fn node(&self) -> &'a Node {
		self.node
	}

	pub fn tag(&self) -> Option<&'a str> {
		self.node.tag()
	}

	fn expect_tag(&self, tag: &str) -> ProtocolResult<Vec<&'a Node>> {
		if self.node.tag() != Some(tag) {
			return Err(mismatch(tag, self.node));
		}
		Ok(self.node.parts())
	}

	fn part(parts: &[&'a Node], index: usize, tag: &str) -> ProtocolResult<&'a Node> {
		parts.get(index).copied().ok_or_else(|| {
			ProtocolError::malformed(format!("'{}' field is missing element {}", tag, index))
		})
	}

	fn terminal_number(node: &Node, tag: &str) -> ProtocolResult<u64> {
		match node {
			Node::Number(n) => Ok(*n),
			Node::Value(bytes) => std::str::from_utf8(bytes)?
				.parse::<u64>()
				.map_err(|_| ProtocolError::malformed(format!("'{}' value is not an integer", tag))),
			Node::Tag { .. } => Err(ProtocolError::malformed(format!(
				"'{}' field has structural children where a value was expected",
				tag
			))),
		}
	}

	fn single_number(&self, tag: &str) -> ProtocolResult<u64> {
		let parts = self.expect_tag(tag)?;
		if parts.len() != 1 {
			return Err(ProtocolError::malformed(format!("'{}' field must hold one value", tag)));
		}
		Self::terminal_number(parts[0], tag)
	}

	pub fn as_uint(&self) -> ProtocolResult<u64> {
		self.single_number(TAG_UINT)
	}

	pub fn as_protocol_version(&self) -> ProtocolResult<u64> {
		self.single_number(TAG_PROTOCOL_VERSION)
	}

	pub fn as_timestamp(&self) -> ProtocolResult<u64> {
		self.single_number(TAG_TIMESTAMP)
	}

	pub fn as_node_id(&self) -> ProtocolResult<u64> {
		let parts = self.expect_tag(TAG_NODE_ID)?;
		Field::new(Self::part(&parts, 0, TAG_NODE_ID)?).as_uint()
	}

	pub fn as_transaction_id(&self) -> ProtocolResult<u64> {
		let parts = self.expect_tag(TAG_TRANSACTION_ID)?;
		Field::new(Self::part(&parts, 0, TAG_TRANSACTION_ID)?).as_uint()
	}

	/// Offset and size
	pub fn as_block(&self) -> ProtocolResult<(u64, u64)> {
		let parts = self.expect_tag(TAG_BLOCK)?;
		let offset = Field::new(Self::part(&parts, 0, TAG_BLOCK)?).as_uint()?;
		let size = Field::new(Self::part(&parts, 1, TAG_BLOCK)?).as_uint()?;
		Ok((offset, size))
	}

	/// Raw string content, checked against the declared length
	pub fn as_bytes(&self) -> ProtocolResult<&'a [u8]> {
		let children = match self.node {
			Node::Tag { name, children } if name == TAG_STRING => children,
			_ => return Err(mismatch(TAG_STRING, self.node)),
		};
		let length = Field::new(
			children.first().ok_or_else(|| ProtocolError::malformed("string without length"))?,
		)
		.as_uint()?;
		let bytes_node =
			children.get(1).ok_or_else(|| ProtocolError::malformed("string without content"))?;
		if bytes_node.tag() != Some(TAG_BYTES) {
			return Err(mismatch(TAG_BYTES, bytes_node));
		}
		let content: &[u8] = match bytes_node.children().first() {
			Some(Node::Value(bytes)) => bytes,
			None => &[],
			Some(_) => return Err(ProtocolError::malformed("string content is not a value")),
		};
		if content.len() as u64 != length {
			return Err(ProtocolError::malformed(format!(
				"string length mismatch: declared {}, got {}",
				length,
				content.len()
			)));
		}
		Ok(content)
	}

	pub fn as_string(&self) -> ProtocolResult<String> {
		Ok(std::str::from_utf8(self.as_bytes()?)?.to_string())
	}

	pub fn as_authority(&self) -> ProtocolResult<Authority> {
		let parts = self.expect_tag(TAG_AUTHORITY)?;
		let kind = Field::new(Self::part(&parts, 0, TAG_AUTHORITY)?).as_uint()?;
		let name = Field::new(Self::part(&parts, 1, TAG_AUTHORITY)?).as_string()?;
		Ok(Authority { kind: AuthorityKind::from_code(kind)?, name })
	}

	pub fn as_list(&self) -> ProtocolResult<Vec<ListElement<'a>>> {
		let parts = self.expect_tag(TAG_LIST)?;
		let size = Field::new(Self::part(&parts, 0, TAG_LIST)?).as_uint()?;
		let mut elements = Vec::with_capacity(parts.len().saturating_sub(1));
		for element in &parts[1..] {
			if element.tag() != Some(TAG_LIST_ELEMENT) {
				return Err(mismatch(TAG_LIST_ELEMENT, element));
			}
			let content = element.parts();
			match content.len() {
				0 => return Err(ProtocolError::malformed("empty list element")),
				1 => elements.push(ListElement::Single(Field::new(content[0]))),
				_ => elements.push(ListElement::Multiple(
					content.into_iter().map(Field::new).collect(),
				)),
			}
		}
		if elements.len() as u64 != size {
			return Err(ProtocolError::malformed(format!(
				"list declares {} elements, got {}",
				size,
				elements.len()
			)));
		}
		Ok(elements)
	}

	pub fn as_key_value(&self) -> ProtocolResult<(String, Field<'a>)> {
		let parts = self.expect_tag(TAG_KEY_VALUE)?;
		if parts.len() != 2 {
			return Err(ProtocolError::malformed("key-value pair must have two fields"));
		}
		let key = Field::new(parts[0]).as_string()?;
		Ok((key, Field::new(parts[1])))
	}

	/// List of key-value pairs as a map; later duplicates win
	pub fn key_value_list_to_map(&self) -> ProtocolResult<BTreeMap<String, Field<'a>>> {
		let mut map = BTreeMap::new();
		for element in self.as_list()? {
			let (key, value) = element.single()?.as_key_value()?;
			map.insert(key, value);
		}
		Ok(map)
	}
}


// vim: ts=4
