//! LOGOUT command handler.

use crate::fake_upstream::io::write_line;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Handle LOGOUT: untagged BYE, then the tagged OK.
pub async fn handle_logout<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    stream: &mut BufReader<S>,
) {
    if write_line(stream, "* BYE logging out\r\n").await.is_err() {
        return;
    }
    let resp = format!("{tag} OK LOGOUT completed\r\n");
    let _ = write_line(stream, &resp).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn run(tag: &str) -> String {
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        handle_logout(tag, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn sends_bye_then_ok() {
        let output = run("A9").await;
        assert!(output.contains("* BYE"));
        assert!(output.ends_with("A9 OK LOGOUT completed\r\n"));
    }

    #[tokio::test]
    async fn bye_comes_before_ok() {
        let output = run("A9").await;
        let bye = output.find("* BYE").unwrap();
        let ok = output.find("A9 OK").unwrap();
        assert!(bye < ok);
    }
}
