//! Deterministic POI id construction, shared by every handler that needs to
//! resolve an oracle-reported name back to a stored POI's `poi_id`.

pub fn poi_id(file_path: &str, kind: &str, name: &str, start_line: i64) -> String {
    format!("{file_path}::{kind}::{name}::{start_line}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poi_id_format() {
        assert_eq!(poi_id("src/lib.rs", "function", "main", 1), "src/lib.rs::function::main::1");
    }
}
