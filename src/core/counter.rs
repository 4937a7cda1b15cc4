//! Purpose: Count records per kind during one transfer and render progress and a summary.
//! Exports: `Counter`, `Item`.
//! Role: Only state shared by concurrent transfer roles; lives for one operation.
//! Invariants: Increments are atomic and never lost; counts only grow.
//! Invariants: Items are created lazily; kinds never touched render as "skipped".
use std::io::{self, Write};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use super::kind::RecordKind;

const SKIPPED: &str = "skipped";
const UNKNOWN_FIELDS_WARNING: &str = "WARNING data contained unknown fields";

#[derive(Debug)]
pub struct Item {
    kind: RecordKind,
    count: AtomicU64,
    skipped: AtomicU64,
}

impl Item {
    fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            count: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn increment(&self) -> &Self {
        self.count.fetch_add(1, Ordering::Relaxed);
        self
    }

    pub fn skip(&self) -> &Self {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        self
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Overwrite the current terminal line with this item's running count.
    pub fn render(&self, out: &mut dyn Write) -> io::Result<()> {
        write!(out, "\u{1b}[2K\r{:>15}: {}", self.kind.label(), self.count())?;
        out.flush()
    }

    fn summary_row(&self) -> String {
        let skipped = self.skipped();
        if skipped > 0 {
            format!(
                "{:>15} {} {UNKNOWN_FIELDS_WARNING} ({skipped} {SKIPPED})",
                self.kind.label(),
                self.count()
            )
        } else {
            format!("{:>15} {}", self.kind.label(), self.count())
        }
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    items: [OnceLock<Item>; 5],
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The item for `kind`, created on first use.
    pub fn item(&self, kind: RecordKind) -> &Item {
        self.items[kind.index()].get_or_init(|| Item::new(kind))
    }

    pub fn get(&self, kind: RecordKind) -> Option<&Item> {
        self.items[kind.index()].get()
    }

    pub fn object_types(&self) -> &Item {
        self.item(RecordKind::ObjectType)
    }

    pub fn permissions(&self) -> &Item {
        self.item(RecordKind::Permission)
    }

    pub fn relation_types(&self) -> &Item {
        self.item(RecordKind::RelationType)
    }

    pub fn objects(&self) -> &Item {
        self.item(RecordKind::Object)
    }

    pub fn relations(&self) -> &Item {
        self.item(RecordKind::Relation)
    }

    pub fn summary_lines(&self) -> Vec<String> {
        RecordKind::ALL
            .iter()
            .map(|&kind| match self.get(kind) {
                Some(item) => item.summary_row(),
                None => format!("{:>15} {SKIPPED}", kind.label()),
            })
            .collect()
    }

    /// Final multi-line summary, one row per kind in replay order.
    pub fn render(&self, out: &mut dyn Write) -> io::Result<()> {
        for line in self.summary_lines() {
            writeln!(out, "{line}")?;
        }
        out.flush()
    }
}
