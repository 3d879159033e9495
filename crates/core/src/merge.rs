//! JSON merge patch (RFC 7386) diff and apply.

use serde_json::{Map, Value as Json};

/// Strip fields the server owns so that two copies of an object compare on
/// what a controller can actually change.
pub fn strip_server_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        #[cfg(feature = "strip-managed-fields")]
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    v
}

/// Merge patch turning `base` into `target`, or `None` when they are equal.
///
/// Arrays are replaced whole. Keys missing from `target` become `null`.
pub fn merge_diff(base: &Json, target: &Json) -> Option<Json> {
    if base == target {
        return None;
    }
    match (base, target) {
        (Json::Object(bo), Json::Object(to)) => {
            let mut out = Map::new();
            for (k, tv) in to.iter() {
                match bo.get(k) {
                    Some(bv) if bv == tv => {}
                    Some(bv) if bv.is_object() && tv.is_object() => {
                        if let Some(sub) = merge_diff(bv, tv) {
                            out.insert(k.clone(), sub);
                        }
                    }
                    _ => {
                        out.insert(k.clone(), tv.clone());
                    }
                }
            }
            for k in bo.keys() {
                if !to.contains_key(k) {
                    out.insert(k.clone(), Json::Null);
                }
            }
            if out.is_empty() { None } else { Some(Json::Object(out)) }
        }
        (_, t) => Some(t.clone()),
    }
}

/// Apply a merge patch in place.
pub fn merge_apply(doc: &mut Json, patch: &Json) {
    let Json::Object(po) = patch else {
        *doc = patch.clone();
        return;
    };
    if !doc.is_object() {
        *doc = Json::Object(Map::new());
    }
    if let Json::Object(dobj) = doc {
        for (k, pv) in po.iter() {
            if pv.is_null() {
                dobj.remove(k);
            } else {
                merge_apply(dobj.entry(k.clone()).or_insert(Json::Null), pv);
            }
        }
    }
}
