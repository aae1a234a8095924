//! `Money`: transfers on behalf of the script.
//!
//! `Charge` draws on the executing account and is capped cumulatively by the
//! invocation's withdrawal limit. `Pay` draws on the script owner's account
//! and `Bill` on whichever account pays for the execution; neither is capped.

use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::{decode_handle, ledger_error, unknown_method, Payer, ServiceEnv, ServiceKind, Withdrawal};
use crate::rpc::{Call, CallError, Reply};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferTo {
    target_account_handle: String,
    amount: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyedTransfer {
    source_account_handle: String,
    source_account_key: String,
    target_account_handle: String,
    amount: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceOf {
    account_handle: String,
}

pub struct MoneyService {
    env: Arc<ServiceEnv>,
}

impl MoneyService {
    pub fn new(env: Arc<ServiceEnv>) -> Self {
        Self { env }
    }

    pub(super) async fn call(&self, method: &str, call: Call) -> Result<Reply, CallError> {
        match method {
            "Charge" => self.charge(call.params()?).await,
            "Pay" => {
                let source = self.env.owner_account.clone();
                self.send(Payer::Owner, &source, call.params()?).await
            }
            "Bill" => {
                let source = self.env.billing_account.clone();
                self.send(Payer::Billing, &source, call.params()?).await
            }
            "Transfer" => self.keyed_transfer(call.params()?).await,
            "GetBalance" => {
                let req: BalanceOf = call.params()?;
                let account = decode_handle(&req.account_handle)?;
                let balance = self.env.ledger.balance(&account).await.map_err(ledger_error)?;
                Reply::json(balance)
            }
            "GetEscrowedFunds" => {
                let charged = self.env.invocation.transfers.lock().await.charged;
                Reply::json(self.env.capabilities.withdrawal_limit - charged)
            }
            other => Err(unknown_method(ServiceKind::Money, other)),
        }
    }

    async fn charge(&self, req: TransferTo) -> Result<Reply, CallError> {
        positive(req.amount)?;
        let target = decode_handle(&req.target_account_handle)?;
        let limit = self.env.capabilities.withdrawal_limit;

        let mut transfers = self.env.invocation.transfers.lock().await;
        if transfers.charged.saturating_add(req.amount) > limit {
            return Err(CallError::new(format!(
                "charge of {} would exceed the withdrawal limit ({} of {limit} used)",
                req.amount, transfers.charged
            )));
        }
        let source = &self.env.executing_account;
        self.env
            .ledger
            .transfer(source, &target, req.amount)
            .await
            .map_err(ledger_error)?;
        transfers.charged += req.amount;
        transfers.log.push(Withdrawal {
            payer: Payer::Executor,
            source: source.clone(),
            target: target.clone(),
            amount: req.amount,
        });
        info!(source = %source, target = %target, amount = req.amount, "sandbox charge");
        Ok(Reply::empty())
    }

    async fn send(&self, payer: Payer, source: &str, req: TransferTo) -> Result<Reply, CallError> {
        positive(req.amount)?;
        let target = decode_handle(&req.target_account_handle)?;
        self.transfer_logged(payer, source, &target, req.amount).await
    }

    async fn keyed_transfer(&self, req: KeyedTransfer) -> Result<Reply, CallError> {
        positive(req.amount)?;
        let source = decode_handle(&req.source_account_handle)?;
        let target = decode_handle(&req.target_account_handle)?;
        let valid = self
            .env
            .ledger
            .verify_key(&source, &req.source_account_key)
            .await
            .map_err(ledger_error)?;
        if !valid {
            return Err(CallError::new("invalid account key"));
        }
        self.transfer_logged(Payer::Keyed, &source, &target, req.amount).await
    }

    async fn transfer_logged(
        &self,
        payer: Payer,
        source: &str,
        target: &str,
        amount: i64,
    ) -> Result<Reply, CallError> {
        self.env
            .ledger
            .transfer(source, target, amount)
            .await
            .map_err(ledger_error)?;
        self.env.invocation.transfers.lock().await.log.push(Withdrawal {
            payer,
            source: source.to_string(),
            target: target.to_string(),
            amount,
        });
        info!(?payer, source, target, amount, "sandbox transfer");
        Ok(Reply::empty())
    }
}

fn positive(amount: i64) -> Result<(), CallError> {
    if amount <= 0 {
        return Err(CallError::new(format!("amount must be positive, got {amount}")));
    }
    Ok(())
}
