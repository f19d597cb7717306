//! AUTHENTICATE command handler.
//!
//! Drives the crate's server-side SASL mechanisms against the
//! configured policy: decode the initial response, feed it through
//! [`ServerMechanism::step`], and translate challenges into `+`
//! continuations. This includes the XOAUTH2 failure dance: a JSON
//! error challenge, then the client's `0x01` ack, then the tagged NO.

use crate::fake_upstream::io::write_line;
use crate::fake_upstream::server::AuthPolicy;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use mailgate::sasl::{
    Mechanism, PlainCredentials, PlainServer, ServerMechanism, ServerStep, Xoauth2Identity,
    Xoauth2Server,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};

/// Handle AUTHENTICATE. Returns whether authentication succeeded.
pub async fn handle_authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    args: &[&str],
    policy: &AuthPolicy,
    stream: &mut BufReader<S>,
) -> bool {
    let Some(&mechanism) = args.first() else {
        let resp = format!("{tag} BAD AUTHENTICATE expects a mechanism\r\n");
        let _ = write_line(stream, &resp).await;
        return false;
    };

    if !mechanism.eq_ignore_ascii_case(policy.mechanism.name()) {
        let resp = format!("{tag} NO unsupported mechanism\r\n");
        let _ = write_line(stream, &resp).await;
        return false;
    }

    // SASL-IR: the initial response may be inline, `=` meaning empty.
    let mut response = match args.get(1) {
        Some(&"=") => Some(Vec::new()),
        Some(encoded) => match BASE64.decode(encoded) {
            Ok(decoded) => Some(decoded),
            Err(_) => {
                let resp = format!("{tag} NO invalid base64 response\r\n");
                let _ = write_line(stream, &resp).await;
                return false;
            }
        },
        None => None,
    };

    let username = policy.username.clone();
    let secret = policy.secret.clone();
    let mut server: Box<dyn ServerMechanism + Send> = match policy.mechanism {
        Mechanism::Plain => Box::new(PlainServer::new(move |creds: &PlainCredentials| {
            if creds.username == username && creds.password == secret {
                Ok(())
            } else {
                Err(mailgate::Error::Auth("invalid credentials".into()))
            }
        })),
        Mechanism::Xoauth2 => Box::new(Xoauth2Server::new(move |id: &Xoauth2Identity| {
            if id.username == username && id.token == secret {
                Ok(())
            } else {
                Err(mailgate::Error::Auth("invalid token".into()))
            }
        })),
    };

    loop {
        match server.step(response.as_deref()) {
            Ok(ServerStep::Done) => {
                // Post-auth capability list, as real servers send it.
                let _ = write_line(stream, "* CAPABILITY IMAP4rev1 IDLE\r\n").await;
                let resp = format!("{tag} OK AUTHENTICATE completed\r\n");
                let _ = write_line(stream, &resp).await;
                return true;
            }
            Ok(ServerStep::Challenge(challenge)) => {
                let cont = format!("+ {}\r\n", BASE64.encode(&challenge));
                if write_line(stream, &cont).await.is_err() {
                    return false;
                }

                let mut line = String::new();
                match stream.read_line(&mut line).await {
                    Ok(0) | Err(_) => return false,
                    Ok(_) => {}
                }
                let trimmed = line.trim();
                if trimmed == "*" {
                    let resp = format!("{tag} BAD authentication aborted\r\n");
                    let _ = write_line(stream, &resp).await;
                    return false;
                }
                match BASE64.decode(trimmed) {
                    Ok(decoded) => response = Some(decoded),
                    Err(_) => {
                        let resp = format!("{tag} NO invalid base64 response\r\n");
                        let _ = write_line(stream, &resp).await;
                        return false;
                    }
                }
            }
            Err(e) => {
                let resp = format!("{tag} NO {e}\r\n");
                let _ = write_line(stream, &resp).await;
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn plain_policy() -> AuthPolicy {
        AuthPolicy {
            mechanism: Mechanism::Plain,
            username: "username".to_string(),
            secret: "password".to_string(),
        }
    }

    fn xoauth2_policy() -> AuthPolicy {
        AuthPolicy {
            mechanism: Mechanism::Xoauth2,
            username: "someuser".to_string(),
            secret: "tok".to_string(),
        }
    }

    /// Run the handler over a duplex pair, feeding it any scripted
    /// client follow-up lines. Returns the handler verdict.
    async fn run(args: &[&str], policy: AuthPolicy, client_script: &[&str]) -> bool {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        for line in client_script {
            client.write_all(line.as_bytes()).await.unwrap();
        }

        // Keep `client` alive so server-side writes succeed.
        let ok = handle_authenticate("A1", args, &policy, &mut stream).await;
        drop(client);
        ok
    }

    #[tokio::test]
    async fn accepts_plain_initial_response() {
        let ir = BASE64.encode(b"\0username\0password");
        assert!(run(&["PLAIN", &ir], plain_policy(), &[]).await);
    }

    #[tokio::test]
    async fn rejects_plain_bad_password() {
        let ir = BASE64.encode(b"\0username\0wrong");
        assert!(!run(&["PLAIN", &ir], plain_policy(), &[]).await);
    }

    #[tokio::test]
    async fn accepts_xoauth2_token() {
        let ir = BASE64.encode(b"user=someuser\x01auth=Bearer tok\x01\x01");
        assert!(run(&["XOAUTH2", &ir], xoauth2_policy(), &[]).await);
    }

    #[tokio::test]
    async fn xoauth2_bad_token_runs_failure_dance() {
        let ir = BASE64.encode(b"user=someuser\x01auth=Bearer bad\x01\x01");
        // The client acks the JSON challenge with a lone 0x01.
        let ack = format!("{}\r\n", BASE64.encode([0x01]));
        assert!(!run(&["XOAUTH2", &ir], xoauth2_policy(), &[&ack]).await);
    }

    #[tokio::test]
    async fn rejects_wrong_mechanism() {
        assert!(!run(&["XOAUTH2", "abc"], plain_policy(), &[]).await);
    }
}
