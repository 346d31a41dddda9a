//! Fingerprints - cache keys over a run's resolved inputs
//!
//! A fingerprint is the blake3 digest of a canonical JSON document:
//!
//! ```text
//! {"version": 2, "task": <name>, "inputs": {<param>: <entry>, ...}}
//! ```
//!
//! Literal entries are `{"literal": <digest of canonical JSON>}`. Artifact
//! entries are `{"codec", "digest", "producer"}`: the content digest of the
//! stored bytes plus the producing run's provenance, which is that run's own
//! fingerprint. Keys therefore chain through the whole upstream graph. A
//! replay carries the fingerprint of the run it replayed, so consuming
//! either one yields the same key. Containers nest as `{"seq": [..]}` and
//! `{"map": {..}}`. `serde_json` maps are ordered, which makes the encoding
//! canonical.

use serde_json::{json, Value};

use crate::artifact::Artifact;
use crate::run::{Binding, Run};
use crate::task::Arg;
use crate::Result;

/// Bump when the fingerprint document changes shape.
pub const FINGERPRINT_VERSION: u32 = 2;

/// blake3 hex digest of a value's canonical JSON encoding.
///
/// # Errors
/// Fails only if the value cannot be serialized.
pub fn digest_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// How an artifact's producer enters the fingerprint of its consumers.
///
/// Runs recorded without a fingerprint fall back to their id.
#[must_use]
pub fn provenance(producer: &Run) -> Value {
    producer.fingerprint().map_or_else(
        || json!({ "run": producer.run_id() }),
        |fingerprint| json!({ "fingerprint": fingerprint }),
    )
}

/// Compute the fingerprint of a call.
///
/// `producer` maps each artifact to its producer's [`provenance`].
///
/// # Errors
/// Fails if an input cannot be serialized or `producer` fails.
pub fn fingerprint<'a, I, P>(task_name: &str, args: I, mut producer: P) -> Result<String>
where
    I: IntoIterator<Item = (&'a str, &'a Arg)>,
    P: FnMut(&Artifact) -> Result<Value>,
{
    let mut entries = serde_json::Map::new();
    for (name, arg) in args {
        entries.insert(name.to_string(), entry(arg, &mut producer)?);
    }
    let document = json!({
        "version": FINGERPRINT_VERSION,
        "task": task_name,
        "inputs": Value::Object(entries),
    });
    digest_json(&document)
}

fn entry<P>(arg: &Arg, producer: &mut P) -> Result<Value>
where
    P: FnMut(&Artifact) -> Result<Value>,
{
    Ok(match arg {
        Arg::Literal(value) => json!({ "literal": digest_json(value)? }),
        Arg::Artifact(artifact) => json!({
            "codec": artifact.codec(),
            "digest": artifact.digest(),
            "producer": producer(artifact)?,
        }),
        Arg::Seq(items) => json!({
            "seq": items.iter().map(|item| entry(item, producer)).collect::<Result<Vec<_>>>()?,
        }),
        Arg::Map(items) => {
            let mut entries = serde_json::Map::new();
            for (key, item) in items {
                entries.insert(key.clone(), entry(item, producer)?);
            }
            json!({ "map": entries })
        }
    })
}

/// Record a literal: verbatim when its canonical encoding fits in `limit`
/// bytes, otherwise as a size/digest summary.
///
/// # Errors
/// Fails only if the value cannot be serialized.
pub fn record_literal(value: &Value, limit: usize) -> Result<Binding> {
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() <= limit {
        return Ok(Binding::Literal {
            value: value.clone(),
        });
    }
    Ok(Binding::Summary {
        bytes: bytes.len(),
        digest: blake3::hash(&bytes).to_hex().to_string(),
    })
}

/// Record an argument. Artifact-free subtrees collapse into one literal;
/// containers holding artifacts keep their shape.
///
/// # Errors
/// Fails only if a literal cannot be serialized.
pub fn record_arg(arg: &Arg, limit: usize) -> Result<Binding> {
    if let Some(value) = arg.to_value() {
        return record_literal(&value, limit);
    }
    Ok(match arg {
        Arg::Artifact(artifact) => Binding::Artifact {
            artifact: artifact.clone(),
        },
        Arg::Seq(items) => Binding::Seq {
            items: items
                .iter()
                .map(|item| record_arg(item, limit))
                .collect::<Result<_>>()?,
        },
        Arg::Map(items) => Binding::Map {
            entries: items
                .iter()
                .map(|(k, v)| record_arg(v, limit).map(|b| (k.clone(), b)))
                .collect::<Result<_>>()?,
        },
        // A literal always has a JSON value.
        Arg::Literal(value) => record_literal(value, limit)?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::run::{NewRun, RunId};

    fn handle(run: u64, digest: &str) -> Artifact {
        serde_json::from_value(json!({
            "run_id": run, "path": format!("runs/{run}/artifacts/a.json"),
            "codec": "json", "digest": digest,
        }))
        .unwrap()
    }

    fn literals<'a>(task: &str, args: &'a [(&'a str, Arg)]) -> String {
        fingerprint(task, args.iter().map(|(k, v)| (*k, v)), |_| Ok(Value::Null)).unwrap()
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = Arg::from(json!({"x": 1, "y": [1, 2]}));
        let b = Arg::from(json!("X"));
        let one = literals("t", &[("a", a.clone()), ("b", b.clone())]);
        let two = literals("t", &[("b", b), ("a", a)]);
        assert_eq!(one, two);
    }

    #[test]
    fn test_fingerprint_separates_task_and_values() {
        let v = Arg::from(json!(1));
        let w = Arg::from(json!(2));
        let base = literals("t", &[("x", v.clone())]);
        assert_ne!(base, literals("u", &[("x", v.clone())]));
        assert_ne!(base, literals("t", &[("x", w)]));
        assert_ne!(base, literals("t", &[("y", v)]));
    }

    #[test]
    fn test_fingerprint_follows_producer_provenance() {
        let arg = Arg::from(handle(1, "same-bytes"));
        let args = [("df", arg)];
        let key = |prov: Value| {
            fingerprint("split", args.iter().map(|(k, v)| (*k, v)), |_| Ok(prov.clone())).unwrap()
        };
        assert_eq!(key(json!({"fingerprint": "f1"})), key(json!({"fingerprint": "f1"})));
        assert_ne!(key(json!({"fingerprint": "f1"})), key(json!({"fingerprint": "f2"})));
    }

    #[test]
    fn test_provenance_prefers_fingerprint() {
        let recorded = Run::pending(RunId::new(4), NewRun::new("t").fingerprint("abc"));
        assert_eq!(provenance(&recorded), json!({"fingerprint": "abc"}));
        let bare = Run::pending(RunId::new(5), NewRun::new("t"));
        assert_eq!(provenance(&bare), json!({"run": 5}));
    }

    #[test]
    fn test_nested_containers_change_key() {
        let flat = literals("t", &[("xs", Arg::from(json!([1, 2])))]);
        let nested = literals("t", &[("xs", Arg::seq([json!(1), json!(2)]))]);
        assert_ne!(flat, nested);
        let swapped = literals("t", &[("xs", Arg::seq([json!(2), json!(1)]))]);
        assert_ne!(nested, swapped);
    }

    #[test]
    fn test_record_literal_summarizes_large_values() {
        let small = json!("abc");
        assert_eq!(
            record_literal(&small, 16).unwrap(),
            Binding::Literal { value: small }
        );

        let large = json!("x".repeat(100));
        match record_literal(&large, 16).unwrap() {
            Binding::Summary { bytes, digest } => {
                assert_eq!(bytes, 102);
                assert_eq!(digest, digest_json(&large).unwrap());
            }
            other => panic!("expected summary, got {other:?}"),
        }
    }

    #[test]
    fn test_record_arg_keeps_artifact_containers() {
        let a = handle(2, "d");
        let arg = Arg::map([
            ("opts", Arg::seq([json!(1), json!(2)])),
            ("frames", Arg::seq([Arg::from(&a)])),
        ]);
        let expected = Binding::Map {
            entries: BTreeMap::from([
                ("frames".to_string(), Binding::Seq { items: vec![Binding::Artifact { artifact: a }] }),
                ("opts".to_string(), Binding::Literal { value: json!([1, 2]) }),
            ]),
        };
        assert_eq!(record_arg(&arg, 1024).unwrap(), expected);
        assert_eq!(
            record_arg(&Arg::seq([json!(1)]), 1024).unwrap(),
            Binding::Literal { value: json!([1]) }
        );
    }
}
