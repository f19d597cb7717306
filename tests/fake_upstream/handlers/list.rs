//! LIST command handler.
//!
//! The fake server has a single INBOX:
//!
//! ```text
//! * LIST (\HasNoChildren) "/" "INBOX"
//! A0002 OK LIST completed
//! ```

use crate::fake_upstream::io::write_line;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Handle LIST. Emits the single INBOX folder.
pub async fn handle_list<S: AsyncRead + AsyncWrite + Unpin>(tag: &str, stream: &mut BufReader<S>) {
    if write_line(stream, "* LIST (\\HasNoChildren) \"/\" \"INBOX\"\r\n")
        .await
        .is_err()
    {
        return;
    }
    let resp = format!("{tag} OK LIST completed\r\n");
    let _ = write_line(stream, &resp).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn lists_inbox_then_tagged_ok() {
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        handle_list("A2", &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        let output = String::from_utf8(buf).unwrap();

        assert!(output.contains("\"INBOX\""));
        assert!(output.ends_with("A2 OK LIST completed\r\n"));
    }
}
