//! Chunked upload over the command channel.
//!
//! Payloads are base64-encoded and appended to the remote file in small
//! pieces so no single execution exceeds the command-length ceiling. Uploads
//! are not resumable: a failed upload starts over from the setup step.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

use crate::channel::{CommandChannel, execute_checked};
use crate::errors::{UploadError, UploadStep};
use crate::powershell;

/// Summary of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub path: String,
    pub bytes: usize,
    /// Number of append executions issued (excludes setup).
    pub chunks: usize,
    pub duration_ms: u64,
}

/// Split base64 text into chunks of at most `chunk_size` characters.
///
/// The size is rounded down to a multiple of 4 (minimum 4) so every chunk
/// decodes on its own. Base64 is ASCII, so byte slicing never splits a
/// character.
pub fn split_chunks(encoded: &str, chunk_size: usize) -> Vec<&str> {
    let chunk_size = effective_chunk_size(chunk_size);
    encoded
        .as_bytes()
        .chunks(chunk_size)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect()
}

fn effective_chunk_size(chunk_size: usize) -> usize {
    (chunk_size.max(4) / 4) * 4
}

/// Upload `bytes` to `path` on the remote host.
///
/// Issues one setup execution, then one append execution per chunk in
/// strict order. An empty payload issues only the setup execution and
/// leaves an empty file behind.
pub async fn upload(
    channel: &dyn CommandChannel,
    path: &str,
    bytes: &[u8],
    chunk_size: usize,
) -> Result<UploadReport, UploadError> {
    let start = Instant::now();
    let encoded = STANDARD.encode(bytes);
    let chunks = split_chunks(&encoded, chunk_size);
    let total = chunks.len();

    info!(path, bytes = bytes.len(), chunks = total, "uploading");

    execute_checked(channel, &powershell::upload_setup(path))
        .await
        .map_err(|e| UploadError::new(path, UploadStep::Setup, e))?;

    for (i, chunk) in chunks.iter().enumerate() {
        let index = i + 1;
        execute_checked(channel, &powershell::upload_chunk(path, chunk))
            .await
            .map_err(|e| UploadError::new(path, UploadStep::Chunk { index, total }, e))?;
        debug!(path, index, total, "chunk appended");
    }

    let duration_ms = start.elapsed().as_millis() as u64;
    info!(path, duration_ms, "upload complete");

    Ok(UploadReport {
        path: path.to_string(),
        bytes: bytes.len(),
        chunks: total,
        duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ChannelError, RemoteStepError};
    use crate::mock::{MockHost, ScriptKind};
    use proptest::prelude::*;

    const PATH: &str = r"C:\Windows\Temp\winrm-uia\uia_run.ps1";

    #[test]
    fn test_split_chunks_sizes() {
        let encoded = "A".repeat(4500);
        let chunks = split_chunks(&encoded, 2000);
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![2000, 2000, 500]);
        assert!(split_chunks("", 2000).is_empty());
    }

    #[test]
    fn test_split_chunks_rounds_to_whole_quanta() {
        let encoded = "A".repeat(20);
        let sizes = |size| split_chunks(&encoded, size).iter().map(|c| c.len()).collect::<Vec<_>>();
        assert_eq!(sizes(7), vec![4, 4, 4, 4, 4]);
        assert_eq!(sizes(10), vec![8, 8, 4]);
        assert_eq!(sizes(0), vec![4, 4, 4, 4, 4]);
    }

    #[tokio::test]
    async fn test_upload_with_odd_chunk_size() {
        let host = MockHost::new();
        let payload = [0xABu8; 5000];
        let report = upload(&host, PATH, &payload, 2001).await.unwrap();
        assert_eq!(report.chunks, 4);
        assert_eq!(host.file(PATH).unwrap(), payload.to_vec());
    }

    #[tokio::test]
    async fn test_empty_payload_issues_only_setup() {
        let host = MockHost::new();
        let report = upload(&host, PATH, b"", 2000).await.unwrap();
        assert_eq!(report.chunks, 0);
        assert_eq!(host.count(ScriptKind::UploadSetup), 1);
        assert_eq!(host.count(ScriptKind::UploadChunk), 0);
        assert_eq!(host.file(PATH).unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_upload_replaces_existing_file() {
        let host = MockHost::new();
        host.put_file(PATH, b"stale content that is longer".to_vec());
        upload(&host, PATH, b"new", 2000).await.unwrap();
        assert_eq!(host.file(PATH).unwrap(), b"new".to_vec());
    }

    #[tokio::test]
    async fn test_setup_failure_skips_chunks_and_keeps_channel_error() {
        let host = MockHost::new();
        host.fail_channel(ScriptKind::UploadSetup);
        let err = upload(&host, PATH, &[7u8; 5000], 2000).await.unwrap_err();
        assert_eq!(err.step, UploadStep::Setup);
        assert!(matches!(
            err.source,
            RemoteStepError::Channel(ChannelError::Connect { .. })
        ));
        assert_eq!(host.count(ScriptKind::UploadChunk), 0);
    }

    #[tokio::test]
    async fn test_chunk_failure_reports_position() {
        let host = MockHost::new();
        host.fail_exit_after(ScriptKind::UploadChunk, 1, 1);
        let err = upload(&host, PATH, &[1u8; 3000], 2000).await.unwrap_err();
        assert_eq!(err.step, UploadStep::Chunk { index: 2, total: 2 });
        assert!(matches!(err.source, RemoteStepError::Failed { exit_code: 1, .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_upload_reassembles_payload(
            payload in proptest::collection::vec(any::<u8>(), 0..20_000),
            chunk_size in 1usize..6000,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let host = MockHost::new();
            let report = runtime.block_on(upload(&host, PATH, &payload, chunk_size)).unwrap();
            let expected_chunks = STANDARD.encode(&payload).len().div_ceil(effective_chunk_size(chunk_size));
            prop_assert_eq!(report.chunks, expected_chunks);
            prop_assert_eq!(host.count(ScriptKind::UploadChunk), expected_chunks);
            prop_assert_eq!(host.file(PATH).unwrap(), payload);
        }
    }
}
