use emberd_script::check::BaseSignatureChecker;
use emberd_script::interpreter::{eval_script, ScriptExecutionMetrics, SCRIPT_64_BIT_INTEGERS};

fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let mut iter = hex.as_bytes().iter().copied();
    while let (Some(high), Some(low)) = (iter.next(), iter.next()) {
        let high = (high as char).to_digit(16)? as u8;
        let low = (low as char).to_digit(16)? as u8;
        bytes.push(high << 4 | low);
    }
    Some(bytes)
}

#[test]
fn script_vectors() {
    let vectors = include_str!("vectors/scripts.json");
    let rows: Vec<serde_json::Value> =
        serde_json::from_str(vectors).expect("parse script vectors json");

    for (index, row) in rows.iter().enumerate() {
        let script_hex = row["script"].as_str().expect("script hex");
        let script = hex_to_bytes(script_hex).expect("decode script hex");

        let mut stack = Vec::new();
        let mut metrics = ScriptExecutionMetrics::default();
        let result = eval_script(
            &script,
            &mut stack,
            SCRIPT_64_BIT_INTEGERS,
            &BaseSignatureChecker,
            None,
            &mut metrics,
        );

        match row.get("error").and_then(|e| e.as_str()) {
            Some(expected) => {
                let err = result.expect_err(&format!("vector {index} should fail"));
                assert_eq!(
                    format!("{err:?}"),
                    expected,
                    "vector {index}: script {script_hex}"
                );
            }
            None => {
                result.unwrap_or_else(|err| {
                    panic!("vector {index}: script {script_hex} failed: {err}")
                });
                let expected: Vec<Vec<u8>> = row["stack"]
                    .as_array()
                    .expect("stack array")
                    .iter()
                    .map(|item| hex_to_bytes(item.as_str().expect("stack hex")).expect("hex"))
                    .collect();
                assert_eq!(stack, expected, "vector {index}: script {script_hex}");
            }
        }
    }
}
