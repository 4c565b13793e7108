//! Tokenizer and BK-tree for approximate term matching.

use std::collections::BTreeMap;

/// Splits text into lowercase tokens on whitespace and ASCII punctuation.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Levenshtein distance over chars.
#[must_use]
pub fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitute = prev[j] + usize::from(ca != *cb);
            row[j + 1] = substitute.min(prev[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

struct Node {
    term: String,
    /// Live references; zero marks a removed term still routing searches.
    refs: usize,
    children: BTreeMap<usize, Node>,
}

impl Node {
    fn new(term: String) -> Self {
        Self {
            term,
            refs: 1,
            children: BTreeMap::new(),
        }
    }
}

/// Metric tree over edit distance with reference-counted terms.
///
/// Removal only drops a term's count; dead nodes are swept by rebuilding
/// once they outnumber live ones.
#[derive(Default)]
pub struct BkTree {
    root: Option<Node>,
    live: usize,
    dead: usize,
}

impl BkTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of distinct live terms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns true if no live terms remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Adds one reference to `term`.
    pub fn insert(&mut self, term: &str) {
        if self.root.is_none() {
            self.root = Some(Node::new(term.to_owned()));
            self.live += 1;
            return;
        }
        let Some(mut node) = self.root.as_mut() else {
            return;
        };
        loop {
            let d = edit_distance(term, &node.term);
            if d == 0 {
                if node.refs == 0 {
                    self.dead -= 1;
                    self.live += 1;
                }
                node.refs += 1;
                return;
            }
            if !node.children.contains_key(&d) {
                node.children.insert(d, Node::new(term.to_owned()));
                self.live += 1;
                return;
            }
            node = match node.children.get_mut(&d) {
                Some(child) => child,
                None => return,
            };
        }
    }

    /// Drops one reference to `term`.
    pub fn remove(&mut self, term: &str) {
        let mut node = self.root.as_mut();
        while let Some(current) = node {
            let d = edit_distance(term, &current.term);
            if d == 0 {
                if current.refs > 0 {
                    current.refs -= 1;
                    if current.refs == 0 {
                        self.live -= 1;
                        self.dead += 1;
                    }
                }
                break;
            }
            node = current.children.get_mut(&d);
        }

        if self.dead > 64 && self.dead > self.live {
            self.rebuild();
        }
    }

    /// Returns live terms within `tolerance` edits of `term`.
    #[must_use]
    pub fn search(&self, term: &str, tolerance: usize) -> Vec<&str> {
        let mut found = Vec::new();
        let mut stack: Vec<&Node> = self.root.iter().collect();
        while let Some(node) = stack.pop() {
            let d = edit_distance(term, &node.term);
            if d <= tolerance && node.refs > 0 {
                found.push(node.term.as_str());
            }
            let lo = d.saturating_sub(tolerance);
            let hi = d + tolerance;
            stack.extend(node.children.range(lo..=hi).map(|(_, child)| child));
        }
        found
    }

    fn rebuild(&mut self) {
        let mut terms = Vec::with_capacity(self.live);
        let mut stack: Vec<Node> = self.root.take().into_iter().collect();
        while let Some(node) = stack.pop() {
            if node.refs > 0 {
                terms.push((node.term, node.refs));
            }
            stack.extend(node.children.into_values());
        }

        self.live = 0;
        self.dead = 0;
        for (term, refs) in terms {
            for _ in 0..refs {
                self.insert(&term);
            }
        }
    }
}

impl std::fmt::Debug for BkTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BkTree")
            .field("live", &self.live)
            .field("dead", &self.dead)
            .finish()
    }
}
