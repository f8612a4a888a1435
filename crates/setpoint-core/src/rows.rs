use std::collections::BTreeSet;
use std::fmt;

use tracing::debug;

/// Anything that can live in an edit buffer.
pub trait RowValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl<T> RowValue for T where T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

/// One editable row. `server_value` is `None` for rows created locally that
/// the server has not seen yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Row<V> {
    pub id: i64,
    pub server_value: Option<V>,
    pub local_value: V,
}

impl<V: PartialEq> Row<V> {
    pub fn is_dirty(&self) -> bool {
        self.server_value.as_ref() != Some(&self.local_value)
    }

    pub fn is_local(&self) -> bool {
        self.server_value.is_none()
    }
}

/// Row as returned by a store read.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRow<V> {
    pub id: i64,
    pub value: V,
}

impl<V> ServerRow<V> {
    pub fn new(id: i64, value: V) -> Self {
        Self { id, value }
    }
}

/// Local mirror of server rows with per-row dirty tracking.
#[derive(Debug, Clone)]
pub struct RowBuffer<V> {
    rows: Vec<Row<V>>,
    next_local_id: i64,
}

impl<V> Default for RowBuffer<V> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            next_local_id: -1,
        }
    }
}

impl<V: RowValue> RowBuffer<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every row with the given server state. Nothing is dirty afterwards.
    pub fn seed(&mut self, rows: impl IntoIterator<Item = ServerRow<V>>) {
        self.rows = rows
            .into_iter()
            .map(|row| Row {
                id: row.id,
                local_value: row.value.clone(),
                server_value: Some(row.value),
            })
            .collect();
        self.next_local_id = -1;
    }

    /// Returns `false` when no row has that id.
    pub fn edit(&mut self, id: i64, value: V) -> bool {
        match self.rows.iter_mut().find(|row| row.id == id) {
            Some(row) => {
                row.local_value = value;
                true
            }
            None => {
                debug!(target = "setpoint::rows", id, "edit ignored for unknown row");
                false
            }
        }
    }

    /// Restores the server value. Locally inserted rows are dropped.
    pub fn revert(&mut self, id: i64) -> bool {
        let Some(index) = self.rows.iter().position(|row| row.id == id) else {
            return false;
        };
        match self.rows[index].server_value.clone() {
            Some(server) => self.rows[index].local_value = server,
            None => {
                self.rows.remove(index);
            }
        }
        true
    }

    pub fn revert_all(&mut self) {
        self.rows.retain(|row| !row.is_local());
        for row in &mut self.rows {
            if let Some(server) = &row.server_value {
                row.local_value = server.clone();
            }
        }
    }

    /// Adds a row the server does not know yet and returns its temporary id.
    pub fn insert_local(&mut self, value: V) -> i64 {
        let id = self.next_local_id;
        self.next_local_id -= 1;
        self.rows.push(Row {
            id,
            server_value: None,
            local_value: value,
        });
        id
    }

    /// Dirty rows in buffer order; exactly what a submit sends.
    pub fn dirty_subset(&self) -> Vec<Row<V>> {
        self.rows.iter().filter(|row| row.is_dirty()).cloned().collect()
    }

    pub fn has_changes(&self) -> bool {
        self.rows.iter().any(Row::is_dirty)
    }

    pub fn get(&self, id: i64) -> Option<&Row<V>> {
        self.rows.iter().find(|row| row.id == id)
    }

    pub fn rows(&self) -> &[Row<V>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Local checks that must pass before a submit goes out.
pub trait RowValidator<V>: Send + Sync {
    fn invalid_rows(&self, rows: &[Row<V>]) -> BTreeSet<i64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl<V> RowValidator<V> for AcceptAll {
    fn invalid_rows(&self, _rows: &[Row<V>]) -> BTreeSet<i64> {
        BTreeSet::new()
    }
}
