//! Tagged tree decoder
//!
//! A message is a sequence of `TAG:payload;` nodes where the payload is
//! either a terminal value or more tagged nodes. There is no schema: the
//! parser decides where a node ends purely from the shape of its children.
//!
//! * A node with exactly one terminal child is a key-value node and ends
//!   right after that child.
//! * A node whose first child is tagged is a list of elements and ends at
//!   the next `;` that follows a complete child.
//!
//! The raw-bytes child of a string (`S:U:<len>;B:<bytes>;`) is the only
//! place where the declared length is consulted, so that `:` and `;`
//! inside string content do not terminate the node early.

use std::fmt;

use super::error::{ProtocolError, ProtocolResult};

pub const TAG_PROTOCOL_VERSION: &str = "V";
pub const TAG_END_OF_MESSAGE: &str = "E";
pub const TAG_UINT: &str = "U";
pub const TAG_NODE_ID: &str = "N";
pub const TAG_STRING: &str = "S";
pub const TAG_BYTES: &str = "B";
pub const TAG_BLOCK: &str = "BL";
pub const TAG_LIST: &str = "L";
pub const TAG_LIST_ELEMENT: &str = "LE";
pub const TAG_KEY_VALUE: &str = "KVP";
pub const TAG_TRANSACTION_ID: &str = "T";
pub const TAG_TIMESTAMP: &str = "TS";
pub const TAG_AUTHORITY: &str = "AUTHORITY";
pub const TAG_RESPONSE: &str = "RSP";
pub const TAG_BATCH_RESPONSE: &str = "RSP-BATCH";
pub const TAG_NOTIFICATION: &str = "NOTIFICATION";

/// Deepest tag nesting accepted; real messages stay below ten levels
pub const MAX_NESTING_DEPTH: usize = 64;

/// One node of a decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
	/// `TAG:children...;`
	Tag { name: String, children: Vec<Node> },
	/// Terminal value, possibly empty
	Value(Vec<u8>),
	/// Terminal value of a `V` or `U` node, coerced at parse time
	Number(u64),
}

impl Node {
	pub fn tag(&self) -> Option<&str> {
		match self {
			Node::Tag { name, .. } => Some(name),
			_ => None,
		}
	}

	/// All children, including empty terminals
	pub fn children(&self) -> &[Node] {
		match self {
			Node::Tag { children, .. } => children,
			_ => &[],
		}
	}

	/// Children without empty terminals
	pub fn parts(&self) -> Vec<&Node> {
		self.children().iter().filter(|c| !c.is_empty_value()).collect()
	}

	pub fn is_empty_value(&self) -> bool {
		matches!(self, Node::Value(v) if v.is_empty())
	}

	pub fn is_terminal(&self) -> bool {
		!matches!(self, Node::Tag { .. })
	}
}

impl fmt::Display for Node {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Node::Tag { name, children } => {
				write!(f, "[{}", name)?;
				for child in children.iter().filter(|c| !c.is_empty_value()) {
					write!(f, ",{}", child)?;
				}
				write!(f, "]")
			}
			Node::Value(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
			Node::Number(n) => write!(f, "{}", n),
		}
	}
}

/// Root of a decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
	pub nodes: Vec<Node>,
}

impl fmt::Display for Tree {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "[")?;
		for (i, node) in self.nodes.iter().enumerate() {
			if i > 0 {
				write!(f, ",")?;
			}
			write!(f, "{}", node)?;
		}
		write!(f, "]")
	}
}

/// Where the node currently being filled sits, as far as strings care
#[derive(Clone, Copy)]
enum Context {
	Plain,
	/// Filling the children of an `S` node with this declared length
	StringBody(usize),
	/// Filling the `B` child of a string: skip this many bytes before looking for delimiters
	RawBytes(usize),
}

struct Parser<'a> {
	input: &'a [u8],
	pos: usize,
	depth: usize,
}

/// Decode one complete message into its tagged tree
///
/// Empty terminals at the root (left over from list terminators) are dropped.
pub fn parse_tree(input: &[u8]) -> ProtocolResult<Tree> {
	let mut parser = Parser { input, pos: 0, depth: 0 };
	let mut nodes = Vec::new();
	while parser.pos < input.len() {
		parser.parse_next(&mut nodes, Context::Plain)?;
	}
	nodes.retain(|n| !n.is_empty_value());
	Ok(Tree { nodes })
}

fn find_from(haystack: &[u8], start: usize, needle: u8) -> Option<usize> {
	haystack.get(start..)?.iter().position(|b| *b == needle).map(|i| i + start)
}

fn is_key_value(children: &[Node]) -> bool {
	children.len() == 1 && children[0].is_terminal()
}

fn is_list_of_elements(children: &[Node]) -> bool {
	children.first().map_or(false, |c| !c.is_terminal())
}

impl<'a> Parser<'a> {
	fn rest(&self) -> &'a [u8] {
		&self.input[self.pos..]
	}

	fn parse_next(&mut self, siblings: &mut Vec<Node>, context: Context) -> ProtocolResult<()> {
		let rest = self.rest();
		let skip = match context {
			Context::RawBytes(len) => {
				if len > rest.len() {
					return Err(ProtocolError::malformed(format!(
						"string declares {} bytes but only {} remain",
						len,
						rest.len()
					)));
				}
				len
			}
			_ => 0,
		};

		let end_of_tag = find_from(rest, skip, b':');
		let end_of_value = find_from(rest, skip, b';');

		match (end_of_tag, end_of_value) {
			(None, None) => {
				if rest.is_empty() {
					Ok(())
				} else {
					Err(ProtocolError::malformed("trailing data without delimiter"))
				}
			}
			(Some(tag_end), value_end) if value_end.map_or(true, |v| tag_end < v) => {
				let name = std::str::from_utf8(&rest[..tag_end])?.to_string();
				self.pos += tag_end + 1;
				if self.depth >= MAX_NESTING_DEPTH {
					return Err(ProtocolError::malformed(format!(
						"tags nested deeper than {} levels",
						MAX_NESTING_DEPTH
					)));
				}
				self.depth += 1;
				let node = self.parse_tagged(name, context);
				self.depth -= 1;
				siblings.push(node?);
				Ok(())
			}
			(_, Some(value_end)) => {
				siblings.push(Node::Value(rest[..value_end].to_vec()));
				self.pos += value_end + 1;
				Ok(())
			}
			// Taken by the guarded arm above
			(Some(_), None) => Err(ProtocolError::malformed("unexpected delimiter order")),
		}
	}

	fn parse_tagged(&mut self, name: String, context: Context) -> ProtocolResult<Node> {
		let mut children: Vec<Node> = Vec::new();
		loop {
			let child_context = if name == TAG_STRING {
				match children.first() {
					Some(Node::Tag { children: len, .. }) => match len.first() {
						Some(Node::Number(n)) => Context::StringBody(*n as usize),
						_ => Context::Plain,
					},
					_ => Context::Plain,
				}
			} else if name == TAG_BYTES {
				match context {
					Context::StringBody(len) => Context::RawBytes(len),
					_ => Context::Plain,
				}
			} else {
				Context::Plain
			};

			self.parse_next(&mut children, child_context)?;

			if is_key_value(&children) {
				if name == TAG_UINT || name == TAG_PROTOCOL_VERSION {
					coerce_number(&name, &mut children[0])?;
				}
				break;
			}
			if is_list_of_elements(&children) && self.rest().first() == Some(&b';') {
				self.pos += 1;
				break;
			}
			if self.rest().is_empty() {
				return Err(ProtocolError::malformed(format!(
					"input exhausted inside '{}'",
					name
				)));
			}
		}
		Ok(Node::Tag { name, children })
	}
}

fn coerce_number(tag: &str, node: &mut Node) -> ProtocolResult<()> {
	if let Node::Value(bytes) = node {
		let text = std::str::from_utf8(bytes)?;
		let n = text.parse::<u64>().map_err(|_| {
			ProtocolError::malformed(format!("'{}' value is not an integer: '{}'", tag, text))
		})?;
		*node = Node::Number(n);
	}
	Ok(())
}


// vim: ts=4
