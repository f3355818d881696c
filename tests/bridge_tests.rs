use anyhow::Result;
use pipecast::pipe;
use std::io::Cursor;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Write `len` pattern bytes to a fresh file and return its path.
fn file_with(len: usize) -> Result<(TempDir, PathBuf)> {
    let dir = TempDir::new()?;
    let path = dir.path().join("data");
    let mut file = std::fs::File::create(&path)?;
    file.write_all(&pattern(len))?;
    file.sync_all()?;
    Ok((dir, path))
}

#[tokio::test]
async fn zero_copy_from_a_regular_file() -> Result<()> {
    let (_dir, path) = file_with(1_000_000)?;
    let (mut reader, mut writer) = pipe()?;

    let drained = tokio::spawn(async move {
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.map(|_| received)
    });

    let mut file = tokio::fs::File::open(&path).await?;
    let moved = writer.receive_from(&mut file, None).await?;
    assert_eq!(moved, 1_000_000);
    drop(writer);

    let received = timeout(Duration::from_secs(10), drained).await???;
    assert_eq!(received, pattern(1_000_000));
    Ok(())
}

#[tokio::test]
async fn bounded_zero_copy_stops_at_the_limit() -> Result<()> {
    // The file holds twice the bound; exactly the bound may cross.
    let (_dir, path) = file_with(2_000_000)?;
    let (mut reader, mut writer) = pipe()?;

    let drained = tokio::spawn(async move {
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.map(|_| received)
    });

    let mut file = tokio::fs::File::open(&path).await?;
    let moved = writer.receive_from(&mut file, Some(1_000_000)).await?;
    assert_eq!(moved, 1_000_000);
    drop(writer);

    let received = timeout(Duration::from_secs(10), drained).await???;
    assert_eq!(received.len(), 1_000_000);
    assert_eq!(received, &pattern(2_000_000)[..1_000_000]);
    Ok(())
}

#[tokio::test]
async fn fallback_copy_matches_the_zero_copy_contract() -> Result<()> {
    let data = pattern(1_000_000);
    let (mut reader, mut writer) = pipe()?;

    let drained = tokio::spawn(async move {
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.map(|_| received)
    });

    let mut cursor = Cursor::new(data.clone());
    let moved = writer.receive_from(&mut cursor, None).await?;
    assert_eq!(moved, 1_000_000);
    drop(writer);

    let received = timeout(Duration::from_secs(10), drained).await???;
    assert_eq!(received, data);
    Ok(())
}

#[tokio::test]
async fn bounded_fallback_stops_at_the_limit() -> Result<()> {
    let data = pattern(2_000_000);
    let (mut reader, mut writer) = pipe()?;

    let drained = tokio::spawn(async move {
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.map(|_| received)
    });

    let mut cursor = Cursor::new(data.clone());
    let moved = writer.receive_from(&mut cursor, Some(1_000_000)).await?;
    assert_eq!(moved, 1_000_000);
    drop(writer);

    let received = timeout(Duration::from_secs(10), drained).await???;
    assert_eq!(received, &data[..1_000_000]);
    Ok(())
}

#[tokio::test]
async fn both_paths_are_exact_across_sizes() -> Result<()> {
    // Around the page size and beyond the default pipe buffer.
    for &len in &[0usize, 1, 4095, 4096, 4097, 262_144] {
        let (_dir, path) = file_with(len)?;
        let (mut reader, mut writer) = pipe()?;
        let drained = tokio::spawn(async move {
            let mut received = Vec::new();
            reader.read_to_end(&mut received).await.map(|_| received)
        });
        let mut file = tokio::fs::File::open(&path).await?;
        let moved = writer.receive_from(&mut file, None).await?;
        assert_eq!(moved as usize, len, "zero-copy length {len}");
        drop(writer);
        let received = timeout(Duration::from_secs(10), drained).await???;
        assert_eq!(received, pattern(len), "zero-copy content {len}");

        let (mut reader, mut writer) = pipe()?;
        let drained = tokio::spawn(async move {
            let mut received = Vec::new();
            reader.read_to_end(&mut received).await.map(|_| received)
        });
        let mut cursor = Cursor::new(pattern(len));
        let moved = writer.receive_from(&mut cursor, None).await?;
        assert_eq!(moved as usize, len, "fallback length {len}");
        drop(writer);
        let received = timeout(Duration::from_secs(10), drained).await???;
        assert_eq!(received, pattern(len), "fallback content {len}");
    }
    Ok(())
}

#[tokio::test]
async fn send_to_a_regular_file_is_zero_copy() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("out");

    let (mut reader, mut writer) = pipe()?;
    {
        use tokio::io::AsyncWriteExt;
        writer.write_all(b"straight to disk").await?;
    }
    drop(writer);

    let mut file = tokio::fs::File::create(&path).await?;
    let moved = reader.send_to(&mut file).await?;
    assert_eq!(moved, 16);
    drop(file);

    assert_eq!(std::fs::read(&path)?, b"straight to disk");
    Ok(())
}

#[tokio::test]
async fn send_to_an_ordinary_writer_falls_back() -> Result<()> {
    let (mut reader, mut writer) = pipe()?;
    {
        use tokio::io::AsyncWriteExt;
        writer.write_all(b"through user space").await?;
    }
    drop(writer);

    let mut sink = Cursor::new(Vec::new());
    let moved = reader.send_to(&mut sink).await?;
    assert_eq!(moved, 18);
    assert_eq!(sink.into_inner(), b"through user space");
    Ok(())
}
