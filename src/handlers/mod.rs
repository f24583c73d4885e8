// HTTP handlers for the Whisper server
//
// This module contains the route handlers and the ingress plumbing shared by
// the three request shapes (multipart upload, base64 JSON, URL JSON).

pub mod form;
pub mod routes;

pub use self::routes::{
    config_echo, config_echo_v1, get_model, health, list_models, transcribe, transcribe_base64,
    transcribe_url,
};

use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;

/// Why a capped stream copy stopped early
#[derive(Debug)]
pub(crate) enum StreamWriteError<E> {
    /// The running byte total would exceed the cap
    TooLarge { written: u64 },
    /// The source stream yielded an error
    Source(E),
    Io(std::io::Error),
}

/// Copy a byte stream to a file, enforcing the size cap mid-transfer.
///
/// The cap is checked before each chunk is written, so at most `cap` bytes
/// ever reach the disk; the oversize chunk itself is discarded.
pub(crate) async fn write_stream_capped<S, B, E>(
    mut stream: S,
    file: &mut tokio::fs::File,
    cap: u64,
) -> Result<u64, StreamWriteError<E>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(StreamWriteError::Source)?;
        let bytes = chunk.as_ref();
        if written + bytes.len() as u64 > cap {
            return Err(StreamWriteError::TooLarge {
                written: written + bytes.len() as u64,
            });
        }
        file.write_all(bytes).await.map_err(StreamWriteError::Io)?;
        written += bytes.len() as u64;
    }
    file.flush().await.map_err(StreamWriteError::Io)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    type NoError = std::convert::Infallible;

    async fn run_capped(chunks: Vec<&'static [u8]>, cap: u64) -> Result<u64, StreamWriteError<NoError>> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut file = tokio::fs::File::create(&path).await.unwrap();
        let source = stream::iter(chunks.into_iter().map(Ok::<_, NoError>));
        let result = write_stream_capped(source, &mut file, cap).await;

        if result.is_err() {
            // nothing beyond the cap may have reached the disk
            let on_disk = tokio::fs::metadata(&path).await.unwrap().len();
            assert!(on_disk <= cap);
        }
        result
    }

    #[tokio::test]
    async fn copies_streams_under_the_cap() {
        let written = run_capped(vec![b"hello", b" ", b"world"], 64).await.unwrap();
        assert_eq!(written, 11);
    }

    #[tokio::test]
    async fn rejects_as_soon_as_the_cap_is_crossed() {
        let err = run_capped(vec![b"aaaa", b"bbbb", b"cccc"], 10)
            .await
            .unwrap_err();
        match err {
            StreamWriteError::TooLarge { written } => assert_eq!(written, 12),
            other => panic!("expected TooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn exact_cap_is_accepted() {
        let written = run_capped(vec![b"12345", b"67890"], 10).await.unwrap();
        assert_eq!(written, 10);
    }
}
