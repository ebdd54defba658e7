use crate::core::Result;
use crate::transaction::Transaction;

/// Durable keyed store of named bindings.
///
/// Every call happens inside a transaction; writes become visible to other
/// transactions only once that transaction commits.
pub trait DataStore: Send + Sync {
    /// Value bound to `name`, or `None` if nothing is bound.
    fn get_binding(&self, txn: &Transaction, name: &str) -> Result<Option<serde_json::Value>>;

    /// Binds `name` to `value`, replacing any previous binding.
    fn set_binding(&self, txn: &Transaction, name: &str, value: serde_json::Value) -> Result<()>;

    /// Removes the binding for `name`. Returns whether a binding existed.
    fn remove_binding(&self, txn: &Transaction, name: &str) -> Result<bool>;

    /// Smallest bound name strictly greater than `after` (the first bound
    /// name when `after` is `None`), or `None` at the end of the store.
    fn next_bound_name(&self, txn: &Transaction, after: Option<&str>) -> Result<Option<String>>;
}
