//! Small async IO helpers.

use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _},
};

use crate::prelude::*;

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write text to a file or stdout, ensuring a trailing newline.
pub async fn write_text(path: Option<&Path>, text: &str) -> Result<()> {
    let mut writer = create_writer(path).await?;
    writer
        .write_all(text.as_bytes())
        .await
        .context("failed to write output")?;
    if !text.ends_with('\n') {
        writer
            .write_all(b"\n")
            .await
            .context("failed to write output")?;
    }
    writer.flush().await.context("failed to flush output")?;
    Ok(())
}
