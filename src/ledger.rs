//! Balances and transfers, owned by an external bank service.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::error::ExecError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("account not found: {0}")]
    NotFound(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("ledger request: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("ledger replied {status}: {body}")]
    Status { status: u16, body: String },

    #[error("bad ledger address {0:?}")]
    Address(String),
}

impl From<LedgerError> for ExecError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(account) => ExecError::NotFound(format!("account {account}")),
            LedgerError::InvalidAmount(amount) => {
                ExecError::InvalidArgument(format!("invalid amount {amount}"))
            }
            LedgerError::InsufficientFunds => {
                ExecError::FailedPrecondition("insufficient funds".into())
            }
            LedgerError::Transport(_) => ExecError::Unavailable("ledger unreachable".into()),
            other => ExecError::internal(other),
        }
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn balance(&self, account: &str) -> Result<i64, LedgerError>;

    /// Add a signed amount. Adjusting a missing account is `NotFound`.
    async fn adjust(&self, account: &str, amount: i64) -> Result<i64, LedgerError>;

    /// Move `amount` from `from` to `to` atomically. Fails without effect if
    /// either account is missing or `from` would go negative.
    async fn transfer(&self, from: &str, to: &str, amount: i64) -> Result<(), LedgerError>;

    async fn verify_key(&self, account: &str, key: &str) -> Result<bool, LedgerError>;

    /// Account owned by a chat user, if any.
    async fn lookup_user(&self, user_id: &str) -> Result<Option<String>, LedgerError>;
}

#[derive(Debug, Clone, Default)]
struct Account {
    balance: i64,
    key: Option<String>,
}

#[derive(Default)]
struct Books {
    accounts: HashMap<String, Account>,
    users: HashMap<String, String>,
}

/// In-process ledger for development and tests.
#[derive(Default)]
pub struct MemoryLedger {
    books: Mutex<Books>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open_account(&self, account: &str, balance: i64, key: Option<&str>) {
        self.books.lock().await.accounts.insert(
            account.to_string(),
            Account {
                balance,
                key: key.map(str::to_string),
            },
        );
    }

    pub async fn link_user(&self, user_id: &str, account: &str) {
        self.books
            .lock()
            .await
            .users
            .insert(user_id.to_string(), account.to_string());
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn balance(&self, account: &str) -> Result<i64, LedgerError> {
        let books = self.books.lock().await;
        books
            .accounts
            .get(account)
            .map(|a| a.balance)
            .ok_or_else(|| LedgerError::NotFound(account.to_string()))
    }

    async fn adjust(&self, account: &str, amount: i64) -> Result<i64, LedgerError> {
        let mut books = self.books.lock().await;
        let entry = books
            .accounts
            .get_mut(account)
            .ok_or_else(|| LedgerError::NotFound(account.to_string()))?;
        entry.balance = entry.balance.saturating_add(amount);
        Ok(entry.balance)
    }

    async fn transfer(&self, from: &str, to: &str, amount: i64) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let mut books = self.books.lock().await;
        if !books.accounts.contains_key(to) {
            return Err(LedgerError::NotFound(to.to_string()));
        }
        let source = books
            .accounts
            .get(from)
            .ok_or_else(|| LedgerError::NotFound(from.to_string()))?;
        let remaining = match source.balance.checked_sub(amount) {
            Some(remaining) if remaining >= 0 => remaining,
            _ => return Err(LedgerError::InsufficientFunds),
        };
        if from == to {
            return Ok(());
        }
        let credited = books
            .accounts
            .get(to)
            .ok_or_else(|| LedgerError::NotFound(to.to_string()))?
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::InvalidAmount(amount))?;
        if let Some(source) = books.accounts.get_mut(from) {
            source.balance = remaining;
        }
        if let Some(target) = books.accounts.get_mut(to) {
            target.balance = credited;
        }
        Ok(())
    }

    async fn verify_key(&self, account: &str, key: &str) -> Result<bool, LedgerError> {
        let books = self.books.lock().await;
        let entry = books
            .accounts
            .get(account)
            .ok_or_else(|| LedgerError::NotFound(account.to_string()))?;
        Ok(entry.key.as_deref() == Some(key))
    }

    async fn lookup_user(&self, user_id: &str) -> Result<Option<String>, LedgerError> {
        Ok(self.books.lock().await.users.get(user_id).cloned())
    }
}

/// Ledger reached over HTTP.
pub struct HttpLedger {
    client: reqwest::Client,
    base: String,
}

#[derive(Deserialize)]
struct BalanceBody {
    balance: i64,
}

#[derive(Deserialize)]
struct VerifyBody {
    valid: bool,
}

#[derive(Deserialize)]
struct LookupBody {
    account: Option<String>,
}

#[derive(Serialize)]
struct TransferBody<'a> {
    from: &'a str,
    to: &'a str,
    amount: i64,
}

impl HttpLedger {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    /// `base` followed by `segments`, each percent-encoded as exactly one
    /// path segment. Ids come from scripts and must not steer the request.
    fn url(&self, segments: &[&str]) -> Result<Url, LedgerError> {
        if let Some(bad) = segments
            .iter()
            .find(|s| s.is_empty() || **s == "." || **s == "..")
        {
            return Err(LedgerError::NotFound(bad.to_string()));
        }
        let mut url = Url::parse(&self.base).map_err(|_| LedgerError::Address(self.base.clone()))?;
        url.path_segments_mut()
            .map_err(|_| LedgerError::Address(self.base.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check(
        &self,
        response: reqwest::Response,
        subject: &str,
    ) -> Result<reqwest::Response, LedgerError> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(LedgerError::NotFound(subject.to_string())),
            StatusCode::PRECONDITION_FAILED => Err(LedgerError::InsufficientFunds),
            status => Err(LedgerError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn balance(&self, account: &str) -> Result<i64, LedgerError> {
        let url = self.url(&["accounts", account, "balance"])?;
        let response = self.client.get(url).send().await?;
        let body: BalanceBody = self.check(response, account).await?.json().await?;
        Ok(body.balance)
    }

    async fn adjust(&self, account: &str, amount: i64) -> Result<i64, LedgerError> {
        let url = self.url(&["accounts", account, "adjust"])?;
        let response = self
            .client
            .post(url)
            .json(&json!({ "amount": amount }))
            .send()
            .await?;
        let body: BalanceBody = self.check(response, account).await?.json().await?;
        Ok(body.balance)
    }

    async fn transfer(&self, from: &str, to: &str, amount: i64) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let url = self.url(&["transfers"])?;
        let response = self
            .client
            .post(url)
            .json(&TransferBody { from, to, amount })
            .send()
            .await?;
        self.check(response, &format!("{from} or {to}")).await?;
        Ok(())
    }

    async fn verify_key(&self, account: &str, key: &str) -> Result<bool, LedgerError> {
        let url = self.url(&["accounts", account, "verify"])?;
        let response = self.client.post(url).json(&json!({ "key": key })).send().await?;
        let body: VerifyBody = self.check(response, account).await?.json().await?;
        Ok(body.valid)
    }

    async fn lookup_user(&self, user_id: &str) -> Result<Option<String>, LedgerError> {
        let url = self.url(&["users", user_id, "account"])?;
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: LookupBody = self.check(response, user_id).await?.json().await?;
        Ok(body.account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger() -> MemoryLedger {
        let ledger = MemoryLedger::new();
        ledger.open_account("alice", 100, Some("k")).await;
        ledger.open_account("bob", 0, None).await;
        ledger
    }

    #[tokio::test]
    async fn transfer_moves_funds() {
        let ledger = ledger().await;
        ledger.transfer("alice", "bob", 40).await.unwrap();
        assert_eq!(ledger.balance("alice").await.unwrap(), 60);
        assert_eq!(ledger.balance("bob").await.unwrap(), 40);
    }

    #[tokio::test]
    async fn transfer_fails_closed() {
        let ledger = ledger().await;
        assert!(matches!(
            ledger.transfer("alice", "bob", 101).await,
            Err(LedgerError::InsufficientFunds)
        ));
        assert!(matches!(
            ledger.transfer("alice", "carol", 1).await,
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            ledger.transfer("alice", "bob", -1).await,
            Err(LedgerError::InvalidAmount(-1))
        ));
        assert_eq!(ledger.balance("alice").await.unwrap(), 100);
        assert_eq!(ledger.balance("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn adjusting_a_missing_account_is_not_found() {
        let ledger = ledger().await;
        assert!(matches!(
            ledger.adjust("ghost", -5).await,
            Err(LedgerError::NotFound(_))
        ));
        assert_eq!(ledger.adjust("bob", -5).await.unwrap(), -5);
    }

    #[tokio::test]
    async fn verifies_keys() {
        let ledger = ledger().await;
        assert!(ledger.verify_key("alice", "k").await.unwrap());
        assert!(!ledger.verify_key("alice", "nope").await.unwrap());
        assert!(!ledger.verify_key("bob", "").await.unwrap());
    }

    #[tokio::test]
    async fn overflowing_transfers_are_refused() {
        let ledger = ledger().await;
        ledger.adjust("bob", -5).await.unwrap();
        assert!(matches!(
            ledger.transfer("bob", "alice", i64::MAX).await,
            Err(LedgerError::InsufficientFunds)
        ));

        ledger.open_account("whale", i64::MAX, None).await;
        assert!(matches!(
            ledger.transfer("whale", "alice", i64::MAX).await,
            Err(LedgerError::InvalidAmount(_))
        ));
        assert_eq!(ledger.balance("whale").await.unwrap(), i64::MAX);
        assert_eq!(ledger.balance("alice").await.unwrap(), 100);
        assert_eq!(ledger.balance("bob").await.unwrap(), -5);
    }

    /// Answers one request with 404 and hands back its request line.
    async fn one_shot_bank() -> (String, tokio::sync::oneshot::Receiver<String>) {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut request_line = String::new();
            stream.read_line(&mut request_line).await.unwrap();
            loop {
                let mut header = String::new();
                stream.read_line(&mut header).await.unwrap();
                if header == "\r\n" || header.is_empty() {
                    break;
                }
            }
            stream
                .get_mut()
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            let _ = tx.send(request_line.trim_end().to_string());
        });
        (format!("http://{addr}/bank/"), rx)
    }

    #[tokio::test]
    async fn account_ids_stay_inside_one_path_segment() {
        let (base, seen) = one_shot_bank().await;
        let ledger = HttpLedger::new(base);
        let err = ledger.balance("../../admin/drain?x=").await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)), "{err}");

        let line = seen.await.unwrap();
        assert!(line.starts_with("GET /bank/accounts/"), "{line}");
        assert!(line.ends_with("/balance HTTP/1.1"), "{line}");
        assert!(!line.contains('?'), "{line}");
        assert!(!line.contains("/admin/"), "{line}");
    }

    #[tokio::test]
    async fn dot_segments_never_leave_the_host() {
        // Nothing listens here; a request would surface as Transport.
        let ledger = HttpLedger::new("http://127.0.0.1:9/bank");
        for id in ["..", ".", ""] {
            assert!(matches!(
                ledger.verify_key(id, "k").await,
                Err(LedgerError::NotFound(_))
            ));
        }
    }
}
