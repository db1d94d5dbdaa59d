//! Fixed-size reads of the raw image.

use cvm_image_core::error::Result;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read up to `size` bytes, fewer only at end of input.
pub async fn read_chunk<R>(reader: &mut R, size: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_chunk_until_eof() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.raw");
        std::fs::write(&path, vec![7u8; 10]).unwrap();
        let mut file = tokio::fs::File::open(&path).await.unwrap();
        assert_eq!(read_chunk(&mut file, 4).await.unwrap().len(), 4);
        assert_eq!(read_chunk(&mut file, 4).await.unwrap().len(), 4);
        assert_eq!(read_chunk(&mut file, 4).await.unwrap(), vec![7u8; 2]);
        assert!(read_chunk(&mut file, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_chunk_from_slow_reader() {
        let (mut client, mut server) = tokio::io::duplex(3);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(b"abcdefgh").await.unwrap();
        });
        assert_eq!(read_chunk(&mut client, 6).await.unwrap(), b"abcdef".to_vec());
    }
}
