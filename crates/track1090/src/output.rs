//! JSON artifacts are written to a temporary file and renamed into place,
//! so consumers polling the output directory never observe a partial file.

use serde_json::Value;
use std::fs;
use std::path::Path;

type Result<T> =
    std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub fn write_json_atomic(dir: &Path, name: &str, json: &Value) -> Result<()> {
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!("{name}.tmp"));
    let mut payload = serde_json::to_vec(json)?;
    payload.push(b'\n');
    fs::write(&tmp, payload)?;
    fs::rename(&tmp, dir.join(name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        write_json_atomic(dir.path(), "receivers.json", &json!({"now": 1.0}))
            .unwrap();
        let data =
            fs::read_to_string(dir.path().join("receivers.json")).unwrap();
        assert_eq!(data, "{\"now\":1.0}\n");

        write_json_atomic(dir.path(), "receivers.json", &json!({"now": 2.0}))
            .unwrap();
        let data =
            fs::read_to_string(dir.path().join("receivers.json")).unwrap();
        assert_eq!(data, "{\"now\":2.0}\n");
        // no stray temporary left behind
        assert!(!dir.path().join("receivers.json.tmp").exists());
    }
}
