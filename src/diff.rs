//! Byte sequence alignment
//!
//! Longest-matching-block alignment of two byte slices producing the
//! opcodes that turn the first into the second. Every element of the
//! second slice takes part in matching; nothing is treated as junk.

use std::collections::HashMap;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
	Equal,
	Replace,
	Delete,
	Insert,
}

/// `a[a]` of the original becomes `b[b]` of the edited slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opcode {
	pub tag: Tag,
	pub a: Range<usize>,
	pub b: Range<usize>,
}

impl Opcode {
	pub fn new(tag: Tag, a: Range<usize>, b: Range<usize>) -> Self {
		Opcode { tag, a, b }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Match {
	a: usize,
	b: usize,
	size: usize,
}

struct Matcher<'a> {
	a: &'a [u8],
	b: &'a [u8],
	b2j: HashMap<u8, Vec<usize>>,
}

impl<'a> Matcher<'a> {
	fn new(a: &'a [u8], b: &'a [u8]) -> Self {
		let mut b2j: HashMap<u8, Vec<usize>> = HashMap::new();
		for (j, byte) in b.iter().enumerate() {
			b2j.entry(*byte).or_default().push(j);
		}
		Matcher { a, b, b2j }
	}

	/// Longest block with `a[i..i+k] == b[j..j+k]` inside the given ranges,
	/// earliest in `a` and then in `b` on ties
	fn longest_match(&self, alo: usize, ahi: usize, blo: usize, bhi: usize) -> Match {
		let mut best = Match { a: alo, b: blo, size: 0 };
		let mut j2len: HashMap<usize, usize> = HashMap::new();
		for i in alo..ahi {
			let mut next: HashMap<usize, usize> = HashMap::new();
			if let Some(positions) = self.b2j.get(&self.a[i]) {
				for &j in positions {
					if j < blo {
						continue;
					}
					if j >= bhi {
						break;
					}
					let k = if j > 0 { j2len.get(&(j - 1)).copied().unwrap_or(0) } else { 0 } + 1;
					next.insert(j, k);
					if k > best.size {
						best = Match { a: i + 1 - k, b: j + 1 - k, size: k };
					}
				}
			}
			j2len = next;
		}
		best
	}

	fn matching_blocks(&self) -> Vec<Match> {
		let mut queue = vec![(0, self.a.len(), 0, self.b.len())];
		let mut blocks = Vec::new();
		while let Some((alo, ahi, blo, bhi)) = queue.pop() {
			let m = self.longest_match(alo, ahi, blo, bhi);
			if m.size == 0 {
				continue;
			}
			blocks.push(m);
			if alo < m.a && blo < m.b {
				queue.push((alo, m.a, blo, m.b));
			}
			if m.a + m.size < ahi && m.b + m.size < bhi {
				queue.push((m.a + m.size, ahi, m.b + m.size, bhi));
			}
		}
		blocks.sort_by_key(|m| (m.a, m.b));

		let mut merged: Vec<Match> = Vec::with_capacity(blocks.len() + 1);
		for m in blocks {
			match merged.last_mut() {
				Some(last) if last.a + last.size == m.a && last.b + last.size == m.b => {
					last.size += m.size;
				}
				_ => merged.push(m),
			}
		}
		merged.push(Match { a: self.a.len(), b: self.b.len(), size: 0 });
		merged
	}
}

/// Opcodes turning `a` into `b`, covering both slices in order
pub fn opcodes(a: &[u8], b: &[u8]) -> Vec<Opcode> {
	let matcher = Matcher::new(a, b);
	let mut codes = Vec::new();
	let (mut i, mut j) = (0, 0);
	for m in matcher.matching_blocks() {
		let tag = match (i < m.a, j < m.b) {
			(true, true) => Some(Tag::Replace),
			(true, false) => Some(Tag::Delete),
			(false, true) => Some(Tag::Insert),
			(false, false) => None,
		};
		if let Some(tag) = tag {
			codes.push(Opcode::new(tag, i..m.a, j..m.b));
		}
		i = m.a + m.size;
		j = m.b + m.size;
		if m.size > 0 {
			codes.push(Opcode::new(Tag::Equal, m.a..i, m.b..j));
		}
	}
	codes
}


// vim: ts=4
