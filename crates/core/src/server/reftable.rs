//! The server-side proxy reference table (§3 "Proxy reference table").

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::object::RemoteObject;

fn identity_of(obj: &Arc<dyn RemoteObject>) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

pub struct RefTable {
    objects: HashMap<u64, (Arc<dyn RemoteObject>, HashSet<u64>)>,
    identity_to_id: HashMap<usize, u64>,
    next_object_id: u64,
    next_ref_id: u64,
}

impl RefTable {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            identity_to_id: HashMap::new(),
            next_object_id: 1,
            next_ref_id: 1,
        }
    }

    /// Looks up or allocates `object_id` for `obj`'s identity, allocates a
    /// fresh `ref_id`, and returns the `(object_id, ref_id)` pair.
    pub fn issue(&mut self, obj: Arc<dyn RemoteObject>) -> (u64, u64) {
        let identity = identity_of(&obj);
        let object_id = *self.identity_to_id.entry(identity).or_insert_with(|| {
            let id = self.next_object_id;
            self.next_object_id += 1;
            id
        });
        let ref_id = self.next_ref_id;
        self.next_ref_id += 1;
        let entry = self
            .objects
            .entry(object_id)
            .or_insert_with(|| (obj, HashSet::new()));
        entry.1.insert(ref_id);
        (object_id, ref_id)
    }

    pub fn get(&self, object_id: u64) -> Option<Arc<dyn RemoteObject>> {
        self.objects.get(&object_id).map(|(obj, _)| obj.clone())
    }

    /// Removes `ref_id` from `object_id`'s outstanding set; purges both
    /// mappings once the set empties (§3 invariant).
    pub fn release(&mut self, object_id: u64, ref_id: u64) {
        let Some((obj, refs)) = self.objects.get_mut(&object_id) else {
            return;
        };
        refs.remove(&ref_id);
        if refs.is_empty() {
            let identity = identity_of(obj);
            self.objects.remove(&object_id);
            self.identity_to_id.remove(&identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::NativeFn;
    use crate::value::Value;

    #[test]
    fn release_all_refs_purges_entry() {
        let mut table = RefTable::new();
        let obj: Arc<dyn RemoteObject> = NativeFn::new("f", |_, _| async { Ok(Value::None) });
        let (oid, r1) = table.issue(obj.clone());
        let (oid2, r2) = table.issue(obj.clone());
        assert_eq!(oid, oid2);
        table.release(oid, r1);
        assert!(table.get(oid).is_some());
        table.release(oid2, r2);
        assert!(table.get(oid).is_none());
    }
}
