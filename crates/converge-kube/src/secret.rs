//! Reading values out of Secret snapshots

use std::io::Read;

use base64::Engine;
use converge_core::Snapshot;
use flate2::read::GzDecoder;

use crate::Error;

/// Decode one key of a Secret's `data` map
///
/// Falls back to `stringData` for secrets that were written but not yet
/// normalised by the API server.
pub fn secret_value(secret: &Snapshot, key: &str) -> Result<String, Error> {
    let bytes = secret_bytes(secret, key)?;
    String::from_utf8(bytes).map_err(|e| utf8_error(secret, key, e))
}

/// Decode one gzip-compressed key of a Secret's `data` map
pub fn gzipped_secret_value(secret: &Snapshot, key: &str) -> Result<String, Error> {
    let compressed = secret_bytes(secret, key)?;
    let mut text = String::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_string(&mut text)
        .map_err(|e| {
            Error::serialization_for_kind(
                "Secret",
                format!("{}/{}: gzip: {}", secret_name(secret), key, e),
            )
        })?;
    Ok(text)
}

fn secret_name(secret: &Snapshot) -> &str {
    secret
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .unwrap_or("secret")
}

fn utf8_error(secret: &Snapshot, key: &str, e: std::string::FromUtf8Error) -> Error {
    Error::serialization_for_kind("Secret", format!("{}/{}: {}", secret_name(secret), key, e))
}

fn secret_bytes(secret: &Snapshot, key: &str) -> Result<Vec<u8>, Error> {
    let name = secret_name(secret);

    if let Some(encoded) = secret.get("data").and_then(|d| d.get(key)).and_then(|v| v.as_str()) {
        return base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| {
                Error::serialization_for_kind("Secret", format!("{}/{}: {}", name, key, e))
            });
    }

    secret
        .get("stringData")
        .and_then(|d| d.get(key))
        .and_then(|v| v.as_str())
        .map(|v| v.as_bytes().to_vec())
        .ok_or_else(|| Error::not_found("Secret key", format!("{}/{}", name, key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_data_keys() {
        let secret = json!({
            "metadata": {"name": "ci-secrets"},
            "data": {"CLUSTER_ID": "YWJjMTIz", "ENV": "c3RhZ2luZw=="}
        });
        assert_eq!(secret_value(&secret, "CLUSTER_ID").unwrap(), "abc123");
        assert_eq!(secret_value(&secret, "ENV").unwrap(), "staging");
    }

    #[test]
    fn missing_key_is_not_found() {
        let secret = json!({"metadata": {"name": "ci-secrets"}, "data": {}});
        let err = secret_value(&secret, "ocm-token-refresh").unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("ci-secrets/ocm-token-refresh"));
    }

    #[test]
    fn invalid_base64_is_a_serialization_error() {
        let secret = json!({"metadata": {"name": "ci-secrets"}, "data": {"ENV": "%%%"}});
        assert!(matches!(
            secret_value(&secret, "ENV"),
            Err(Error::Serialization { .. })
        ));
    }

    fn gzipped(text: &str) -> String {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        base64::engine::general_purpose::STANDARD.encode(encoder.finish().unwrap())
    }

    #[test]
    fn decompresses_gzipped_keys() {
        let config = "scrape_configs:\n- job_name: serviceMonitor/nvidia-gpu-operator/nvidia-dcgm-exporter/0\n";
        let secret = json!({
            "metadata": {"name": "prometheus-k8s"},
            "data": {"prometheus.yaml.gz": gzipped(config)}
        });
        assert_eq!(gzipped_secret_value(&secret, "prometheus.yaml.gz").unwrap(), config);
    }

    #[test]
    fn uncompressed_data_is_a_gzip_error() {
        let secret = json!({"metadata": {"name": "prometheus-k8s"}, "data": {"prometheus.yaml.gz": "c3RhZ2luZw=="}});
        let err = gzipped_secret_value(&secret, "prometheus.yaml.gz").unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(err.to_string().contains("gzip"));
    }

    #[test]
    fn string_data_is_read_verbatim() {
        let secret = json!({"stringData": {"ENV": "production"}});
        assert_eq!(secret_value(&secret, "ENV").unwrap(), "production");
    }
}
