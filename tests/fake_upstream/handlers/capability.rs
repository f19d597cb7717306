//! CAPABILITY command handler.

use crate::fake_upstream::io::write_line;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Handle CAPABILITY with the fake server's fixed list.
pub async fn handle_capability<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    stream: &mut BufReader<S>,
) {
    if write_line(stream, "* CAPABILITY IMAP4rev1 IDLE\r\n")
        .await
        .is_err()
    {
        return;
    }
    let resp = format!("{tag} OK CAPABILITY completed\r\n");
    let _ = write_line(stream, &resp).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn run(tag: &str) -> String {
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        handle_capability(tag, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn sends_capability_list() {
        let output = run("A3").await;
        assert!(output.starts_with("* CAPABILITY IMAP4rev1 IDLE\r\n"));
    }

    #[tokio::test]
    async fn ends_with_tagged_ok() {
        let output = run("A3").await;
        assert!(output.ends_with("A3 OK CAPABILITY completed\r\n"));
    }
}
