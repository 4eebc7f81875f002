//! Key rotation.
//!
//! A rotation backlog is converged by [`converge`], a bounded loop over
//! rounds. Each round offers every pending record to a [`RotationStep`];
//! records whose previous key is not available yet are deferred to the next
//! round. The loop stops when nothing is pending or the round budget is
//! spent. Leftovers are reported, not raised.
//!
//! ```text
//! backlog ──▶ round 1 ──▶ deferred ──▶ round 2 ──▶ ... ──▶ RotationReport
//!               │                        │                 (applied, pending)
//!               └─ applied               └─ applied
//! ```
//!
//! Records are applied strictly one after another: a record may depend on
//! the key the previous one delivered.
//!
//! [`RotationCoordinator`] wires the loop to group and user key rotation.

use async_trait::async_trait;
use log::{debug, info, warn};

use super::resolver::KeyGraphResolver;
use super::types::{GroupData, GroupKey, RotationRecord, VerifyLevel};
use crate::error::Result;
use crate::net::types::KeyRotationStarted;
use crate::net::HttpMethod;
use crate::user::{UserKey, UserSession};

/// Outcome of offering one record to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The record was applied.
    Applied,
    /// The record waits for a later round.
    Deferred,
}

/// Applies one rotation record.
#[async_trait]
pub trait RotationStep: Send {
    /// Tries to apply `record`.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures that must abort the backlog. A
    /// record that cannot be applied yet is [`StepOutcome::Deferred`].
    async fn try_apply(&mut self, record: &RotationRecord) -> Result<StepOutcome>;
}

/// Result of converging a backlog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    /// Ids of the generations applied, in application order.
    pub applied: Vec<String>,
    /// Records still pending after the last round.
    pub pending: Vec<RotationRecord>,
    /// Rounds run.
    pub rounds: usize,
}

impl RotationReport {
    /// Returns true if nothing is left pending.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Offers every record once. Returns the applied generation ids and the
/// deferred records, in their original order.
///
/// # Errors
///
/// Returns the first error a step raises.
pub async fn run_round<S>(
    records: Vec<RotationRecord>,
    step: &mut S,
) -> Result<(Vec<String>, Vec<RotationRecord>)>
where
    S: RotationStep + ?Sized,
{
    let mut applied = Vec::new();
    let mut deferred = Vec::new();

    for record in records {
        match step.try_apply(&record).await? {
            StepOutcome::Applied => applied.push(record.new_group_key_id),
            StepOutcome::Deferred => deferred.push(record),
        }
    }

    Ok((applied, deferred))
}

/// Runs rounds until nothing is pending or `round_budget` rounds are spent.
/// A budget of zero runs one round.
///
/// # Errors
///
/// Returns the first error a step raises.
pub async fn converge<S>(
    records: Vec<RotationRecord>,
    round_budget: usize,
    step: &mut S,
) -> Result<RotationReport>
where
    S: RotationStep + ?Sized,
{
    let budget = round_budget.max(1);
    let mut report = RotationReport::default();
    let mut pending = records;

    while !pending.is_empty() && report.rounds < budget {
        report.rounds += 1;
        let offered = pending.len();
        let (applied, deferred) = run_round(pending, step).await?;
        debug!(
            "rotation round {}: {} of {offered} records applied",
            report.rounds,
            applied.len()
        );
        report.applied.extend(applied);
        pending = deferred;
    }

    if !pending.is_empty() {
        warn!(
            "{} rotation records still pending after {} rounds",
            pending.len(),
            report.rounds
        );
    }
    report.pending = pending;
    Ok(report)
}

// ==================== Steps ====================

struct GroupRotationStep<'r, 'a> {
    resolver: &'r mut KeyGraphResolver<'a>,
    data: &'r mut GroupData,
    public_key: String,
    verify: VerifyLevel,
}

#[async_trait]
impl RotationStep for GroupRotationStep<'_, '_> {
    async fn try_apply(&mut self, record: &RotationRecord) -> Result<StepOutcome> {
        let pre = match self
            .resolver
            .get_group_key(self.data, &record.pre_group_key_id, false, self.verify)
            .await
        {
            Ok(key) => key,
            Err(e) => {
                debug!(
                    "deferring generation {} of group {}: {e}",
                    record.new_group_key_id, self.data.group_id
                );
                return Ok(StepOutcome::Deferred);
            }
        };

        let private_key = self
            .resolver
            .private_key(self.data, &record.encrypted_eph_key_key_id)
            .await?;
        let ctx = self.resolver.context();
        let body = ctx.crypto.done_key_rotation(
            &record.server_output,
            &pre.group_key,
            &self.public_key,
            &private_key,
        )?;

        let jwt = self.resolver.user().jwt().await?;
        ctx.call_general(
            ctx.request(
                HttpMethod::Put,
                &format!(
                    "api/v1/group/{}/key_rotation/{}",
                    self.data.group_id, record.new_group_key_id
                ),
            )
            .with_body(body)
            .with_jwt(jwt)
            .with_group_as_member(self.data.access_by_group_as_member.as_deref()),
        )
        .await?;

        self.resolver
            .get_group_key(self.data, &record.new_group_key_id, true, self.verify)
            .await?;
        Ok(StepOutcome::Applied)
    }
}

struct UserRotationStep<'u> {
    user: &'u mut UserSession,
}

#[async_trait]
impl RotationStep for UserRotationStep<'_> {
    async fn try_apply(&mut self, record: &RotationRecord) -> Result<StepOutcome> {
        let pre = match self.user.user_key(&record.pre_group_key_id, false).await {
            Ok(key) => key,
            Err(e) => {
                debug!("deferring user key generation {}: {e}", record.new_group_key_id);
                return Ok(StepOutcome::Deferred);
            }
        };

        let ctx = self.user.context().clone();
        let device = self.user.device();
        let body = ctx.crypto.done_key_rotation(
            &record.server_output,
            &pre.group_key,
            &device.public_key,
            &device.private_key,
        )?;

        let jwt = self.user.jwt().await?;
        ctx.call_general(
            ctx.request(
                HttpMethod::Put,
                &format!("api/v1/user/user_keys/rotation/{}", record.new_group_key_id),
            )
            .with_body(body)
            .with_jwt(jwt),
        )
        .await?;

        self.user.user_key(&record.new_group_key_id, true).await?;
        Ok(StepOutcome::Applied)
    }
}

// ==================== Coordinator ====================

/// Starts and finishes group and user key rotations.
pub struct RotationCoordinator<'r, 'a> {
    resolver: &'r mut KeyGraphResolver<'a>,
}

impl<'r, 'a> RotationCoordinator<'r, 'a> {
    /// Creates a coordinator working through `resolver`.
    pub fn new(resolver: &'r mut KeyGraphResolver<'a>) -> Self {
        Self { resolver }
    }

    /// Starts a rotation of `data`'s group and returns the new generation,
    /// which becomes the newest key right away.
    ///
    /// The new generation is wrapped with the public key of the group's
    /// access path, so a child group rotates with its parent's key.
    ///
    /// # Errors
    ///
    /// Returns resolution, crypto, transport or server errors.
    pub async fn start_group_rotation(
        &mut self,
        data: &mut GroupData,
        sign: bool,
    ) -> Result<GroupKey> {
        let ctx = self.resolver.context();
        let newest = data.newest_key()?.group_key.clone();
        let (public_key, _) = self.resolver.public_key(data).await?;

        let user = self.resolver.user();
        let sign_key = if sign {
            Some(user.newest_key()?.sign_key.clone())
        } else {
            None
        };
        let body = ctx.crypto.prepare_key_rotation(
            &newest,
            &public_key,
            sign_key.as_deref(),
            user.user_id(),
        )?;

        let jwt = user.jwt().await?;
        let started: KeyRotationStarted = ctx
            .call(
                ctx.request(
                    HttpMethod::Post,
                    &format!("api/v1/group/{}/key_rotation", data.group_id),
                )
                .with_body(body)
                .with_jwt(jwt)
                .with_group_as_member(data.access_by_group_as_member.as_deref()),
            )
            .await?;
        info!(
            "started rotation of group {} to generation {}",
            data.group_id, started.key_id
        );

        self.resolver
            .get_group_key(data, &started.key_id, true, VerifyLevel::Off)
            .await
    }

    /// Applies the rotation backlog of `data`'s group.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors, and errors of records whose
    /// previous key is available but that still fail to apply.
    pub async fn finish_group_rotation(
        &mut self,
        data: &mut GroupData,
        verify: VerifyLevel,
    ) -> Result<RotationReport> {
        let ctx = self.resolver.context();
        let jwt = self.resolver.user().jwt().await?;
        let records: Vec<RotationRecord> = ctx
            .call(
                ctx.request(
                    HttpMethod::Get,
                    &format!("api/v1/group/{}/key_rotation", data.group_id),
                )
                .with_jwt(jwt)
                .with_group_as_member(data.access_by_group_as_member.as_deref()),
            )
            .await?;
        if records.is_empty() {
            return Ok(RotationReport::default());
        }

        let (public_key, _) = self.resolver.public_key(data).await?;
        let mut step = GroupRotationStep {
            resolver: &mut *self.resolver,
            data: &mut *data,
            public_key,
            verify,
        };
        let report = converge(records, ctx.config.rotation_round_budget, &mut step).await?;

        if report.is_complete() {
            data.key_update = false;
        }
        self.resolver.save_group(data).await?;
        Ok(report)
    }

    /// Starts a rotation of the user's keys and returns the new generation.
    ///
    /// # Errors
    ///
    /// Returns crypto, transport or server errors.
    pub async fn start_user_rotation(&mut self) -> Result<UserKey> {
        let user = self.resolver.user();
        let ctx = user.context().clone();
        let body = ctx.crypto.prepare_user_key_rotation(
            &user.newest_key()?.group_key,
            &user.device().public_key,
        )?;

        let jwt = user.jwt().await?;
        let started: KeyRotationStarted = ctx
            .call(
                ctx.request(HttpMethod::Post, "api/v1/user/user_keys/rotation")
                    .with_body(body)
                    .with_jwt(jwt),
            )
            .await?;
        info!("started user key rotation to generation {}", started.key_id);

        user.user_key(&started.key_id, true).await
    }

    /// Applies the user's rotation backlog on this device.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn finish_user_rotation(&mut self) -> Result<RotationReport> {
        let user = self.resolver.user();
        let ctx = user.context().clone();
        let jwt = user.jwt().await?;
        let records: Vec<RotationRecord> = ctx
            .call(
                ctx.request(HttpMethod::Get, "api/v1/user/user_keys/rotation").with_jwt(jwt),
            )
            .await?;
        if records.is_empty() {
            return Ok(RotationReport::default());
        }

        let mut step = UserRotationStep { user };
        let report = converge(records, ctx.config.rotation_round_budget, &mut step).await?;
        step.user.save().await?;
        Ok(report)
    }
}
