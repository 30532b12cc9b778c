//! Call session lifecycle service.

use crate::db::Repository;
use crate::domain::{AccountKind, MeteredSession, OwnerId, TimeMs, Tokens};
use crate::metering::cooldown::CooldownCache;
use crate::settlement::{ChargeOutcome, SettlementEngine, SettlementError};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("Caller and callee must differ")]
    SelfCall,
    #[error("Rate must be positive")]
    InvalidRate,
    #[error("Too many call attempts to this user; try again shortly")]
    CoolingDown,
    #[error("Session {0} not found")]
    SessionNotFound(String),
    #[error("Session is not in a state that allows this transition")]
    InvalidTransition,
    #[error("Only the callee may answer")]
    NotCallee,
    #[error("Only a participant may end the call")]
    NotParticipant,
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error("Call operation failed: {0}")]
    Db(#[from] sqlx::Error),
}

pub struct CallService {
    repo: Arc<Repository>,
    engine: Arc<SettlementEngine>,
    cooldowns: CooldownCache,
}

impl CallService {
    pub fn new(
        repo: Arc<Repository>,
        engine: Arc<SettlementEngine>,
        cooldowns: CooldownCache,
    ) -> Self {
        Self {
            repo,
            engine,
            cooldowns,
        }
    }

    /// Start ringing a callee. The caller pays; the rate is fixed for the
    /// session's lifetime at initiation.
    pub async fn initiate(
        &self,
        caller: &OwnerId,
        callee: &OwnerId,
        rate_per_interval: Tokens,
    ) -> Result<MeteredSession, CallError> {
        if caller == callee {
            return Err(CallError::SelfCall);
        }
        if !rate_per_interval.is_positive() {
            return Err(CallError::InvalidRate);
        }
        if !self
            .cooldowns
            .check_and_touch(caller.as_str(), callee.as_str(), TimeMs::now())
        {
            return Err(CallError::CoolingDown);
        }

        let payer = self
            .repo
            .get_or_create_account(caller, AccountKind::User)
            .await?;
        let payee = self
            .repo
            .get_or_create_account(callee, AccountKind::User)
            .await?;

        let session = self
            .repo
            .create_session(payer.id, payee.id, rate_per_interval)
            .await?;
        Ok(session)
    }

    /// Callee accepts; billing starts from the acceptance instant.
    pub async fn accept(&self, session_id: &str, principal: &OwnerId) -> Result<MeteredSession, CallError> {
        let session = self.require_session(session_id).await?;
        self.require_payee(&session, principal).await?;

        if !self
            .repo
            .mark_session_connected(session_id, TimeMs::now())
            .await?
        {
            return Err(CallError::InvalidTransition);
        }
        self.require_session(session_id).await
    }

    /// Callee declines a ringing call. Nothing is billed.
    pub async fn decline(&self, session_id: &str, principal: &OwnerId) -> Result<MeteredSession, CallError> {
        let session = self.require_session(session_id).await?;
        self.require_payee(&session, principal).await?;

        if !self
            .repo
            .mark_session_declined(session_id, TimeMs::now())
            .await?
        {
            return Err(CallError::InvalidTransition);
        }
        self.require_session(session_id).await
    }

    /// Either participant hangs up. Completed intervals are billed before
    /// the transition; a partial interval is dropped.
    pub async fn end(
        &self,
        session_id: &str,
        principal: &OwnerId,
    ) -> Result<(MeteredSession, ChargeOutcome), CallError> {
        let session = self.require_session(session_id).await?;

        let payer = self.repo.get_account_by_id(session.payer_account_id).await?;
        let payee = self.repo.get_account_by_id(session.payee_account_id).await?;
        let is_participant = [payer, payee]
            .iter()
            .flatten()
            .any(|a| &a.owner_id == principal);
        if !is_participant {
            return Err(CallError::NotParticipant);
        }

        let outcome = self.engine.end_session(&session, TimeMs::now()).await?;
        let session = self.require_session(session_id).await?;
        Ok((session, outcome))
    }

    pub async fn get(&self, session_id: &str) -> Result<MeteredSession, CallError> {
        self.require_session(session_id).await
    }

    async fn require_session(&self, session_id: &str) -> Result<MeteredSession, CallError> {
        self.repo
            .get_session(session_id)
            .await?
            .ok_or_else(|| CallError::SessionNotFound(session_id.to_string()))
    }

    async fn require_payee(
        &self,
        session: &MeteredSession,
        principal: &OwnerId,
    ) -> Result<(), CallError> {
        let payee = self
            .repo
            .get_account_by_id(session.payee_account_id)
            .await?;
        match payee {
            Some(account) if &account.owner_id == principal => Ok(()),
            _ => Err(CallError::NotCallee),
        }
    }
}
