use indexmap::IndexMap;

use super::models::ParsedEvent;

/// Events of one drained batch that target the same table, in batch order
#[derive(Debug, Clone, PartialEq)]
pub struct TableGroup {
    pub table: String,
    pub events: Vec<ParsedEvent>,
}

impl TableGroup {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Group events by target table.
///
/// Tables come out in order of first appearance and each group keeps the
/// relative order its events had in the batch.
pub fn group_by_table(events: Vec<ParsedEvent>) -> Vec<TableGroup> {
    let mut by_table: IndexMap<String, Vec<ParsedEvent>> = IndexMap::new();
    for event in events {
        by_table.entry(event.table.clone()).or_default().push(event);
    }

    by_table
        .into_iter()
        .map(|(table, events)| TableGroup { table, events })
        .collect()
}
