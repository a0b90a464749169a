use serde_json::Value;

use crate::model::{Lockfile, LOCKFILE_VERSION};
use crate::LockError;

/// Render a lockfile as canonical JSON: keys sorted recursively, stable
/// indentation, trailing newline. Identical inputs produce identical bytes
/// regardless of in-memory iteration order.
pub fn render(lockfile: &Lockfile) -> Result<String, LockError> {
    lockfile.validate()?;
    let mut value = serde_json::to_value(lockfile)
        .map_err(|err| LockError::Serialize(err.to_string()))?;
    sort_json_value(&mut value);
    let mut rendered = serde_json::to_string_pretty(&value)
        .map_err(|err| LockError::Serialize(err.to_string()))?;
    rendered.push('\n');
    Ok(rendered)
}

/// Parse and validate a lock document, rejecting unknown versions.
pub fn parse(raw: &str) -> Result<Lockfile, LockError> {
    let probe: Value =
        serde_json::from_str(raw).map_err(|err| LockError::Parse(err.to_string()))?;
    let version = probe
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| LockError::Parse("lock document has no version field".to_string()))?;
    if version != u64::from(LOCKFILE_VERSION) {
        return Err(LockError::UnsupportedVersion {
            found: version,
            supported: LOCKFILE_VERSION,
        });
    }
    let lockfile: Lockfile =
        serde_json::from_value(probe).map_err(|err| LockError::Parse(err.to_string()))?;
    lockfile.validate()?;
    Ok(lockfile)
}

fn sort_json_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, entry) in &mut entries {
                sort_json_value(entry);
            }
            map.extend(entries);
        }
        Value::Array(items) => {
            for item in items {
                sort_json_value(item);
            }
        }
        _ => {}
    }
}
