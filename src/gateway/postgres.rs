//! `sqlx`-backed persistence gateway.
//!
//! The relational schema is an external concern (design Non-goals); the
//! column names below are the minimal shape the named operations here
//! need. Queries are built with the dynamic `sqlx::query`/`query_as`
//! API rather than the `query!` compile-time macros, since there is no
//! live database to check the SQL against at build time here — the
//! same tradeoff the sibling web backend in this family makes when it
//! can't always reach a dev database from CI.

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use crate::error::AppError;
use crate::gateway::PersistenceGateway;
use crate::models::segment::SegmentPredicate;
use crate::models::{
    AbTest, Assignment, Campaign, Recipient, SuppressionEntry, SuppressionScope, TrackingEvent,
    TrackingEventKind,
};

pub struct PostgresGateway {
    pool: PgPool,
}

impl PostgresGateway {
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_campaign(row: &sqlx::postgres::PgRow) -> Result<Campaign, AppError> {
    let content: serde_json::Value = row.try_get("content")?;
    let audience: serde_json::Value = row.try_get("audience")?;
    let status: serde_json::Value = row.try_get("status")?;
    Ok(Campaign {
        id: row.try_get("id")?,
        org: row.try_get("org_id")?,
        audience: serde_json::from_value(audience).map_err(|e| AppError::Internal(e.into()))?,
        content: serde_json::from_value(content).map_err(|e| AppError::Internal(e.into()))?,
        status: serde_json::from_value(status).map_err(|e| AppError::Internal(e.into()))?,
        scheduled_at: row.try_get("scheduled_at")?,
        sent: row.try_get("sent")?,
        delivered: row.try_get("delivered")?,
        bounced: row.try_get("bounced")?,
        complaints: row.try_get("complaints")?,
        opened_unique: row.try_get("opened_unique")?,
        clicked_unique: row.try_get("clicked_unique")?,
        revenue: row.try_get("revenue")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl PersistenceGateway for PostgresGateway {
    async fn list_orgs(&self) -> Result<Vec<Uuid>, AppError> {
        let rows = sqlx::query("SELECT DISTINCT org_id FROM mailing_campaigns")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| row.try_get("org_id").map_err(AppError::from)).collect()
    }

    async fn get_campaign(&self, org: Uuid, id: Uuid) -> Result<Campaign, AppError> {
        let row = sqlx::query(
            "SELECT * FROM mailing_campaigns WHERE id = $1 AND org_id = $2",
        )
        .bind(id)
        .bind(org)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("campaign {id}")))?;
        row_to_campaign(&row)
    }

    async fn upsert_campaign(&self, campaign: Campaign) -> Result<Campaign, AppError> {
        sqlx::query(
            "INSERT INTO mailing_campaigns
                (id, org_id, audience, content, status, scheduled_at, sent, delivered,
                 bounced, complaints, opened_unique, clicked_unique, revenue, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
             ON CONFLICT (id) DO UPDATE SET
                audience = EXCLUDED.audience, content = EXCLUDED.content, status = EXCLUDED.status,
                scheduled_at = EXCLUDED.scheduled_at, sent = EXCLUDED.sent, delivered = EXCLUDED.delivered,
                bounced = EXCLUDED.bounced, complaints = EXCLUDED.complaints,
                opened_unique = EXCLUDED.opened_unique, clicked_unique = EXCLUDED.clicked_unique,
                revenue = EXCLUDED.revenue, updated_at = EXCLUDED.updated_at",
        )
        .bind(campaign.id)
        .bind(campaign.org)
        .bind(serde_json::to_value(&campaign.audience).map_err(|e| AppError::Internal(e.into()))?)
        .bind(serde_json::to_value(&campaign.content).map_err(|e| AppError::Internal(e.into()))?)
        .bind(serde_json::to_value(campaign.status).map_err(|e| AppError::Internal(e.into()))?)
        .bind(campaign.scheduled_at)
        .bind(campaign.sent)
        .bind(campaign.delivered)
        .bind(campaign.bounced)
        .bind(campaign.complaints)
        .bind(campaign.opened_unique)
        .bind(campaign.clicked_unique)
        .bind(campaign.revenue)
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(campaign)
    }

    async fn list_campaigns(&self, org: Uuid) -> Result<Vec<Campaign>, AppError> {
        let rows = sqlx::query("SELECT * FROM mailing_campaigns WHERE org_id = $1")
            .bind(org)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_campaign).collect()
    }

    async fn get_recipient(&self, org: Uuid, id: Uuid) -> Result<Recipient, AppError> {
        let row = sqlx::query("SELECT * FROM mailing_recipients WHERE id = $1 AND org_id = $2")
            .bind(id)
            .bind(org)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("recipient {id}")))?;
        row_to_recipient(&row)
    }

    async fn upsert_recipient(&self, recipient: Recipient) -> Result<Recipient, AppError> {
        sqlx::query(
            "INSERT INTO mailing_recipients
                (id, org_id, list_id, email, email_hash, status, engagement_score,
                 last_open_at, last_click_at, total_sent, total_opens, total_clicks,
                 total_bounces, total_complaints, optimal_send_hour, optimal_send_day, custom_fields)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
             ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status, engagement_score = EXCLUDED.engagement_score,
                last_open_at = EXCLUDED.last_open_at, last_click_at = EXCLUDED.last_click_at,
                total_sent = EXCLUDED.total_sent, total_opens = EXCLUDED.total_opens,
                total_clicks = EXCLUDED.total_clicks, total_bounces = EXCLUDED.total_bounces,
                total_complaints = EXCLUDED.total_complaints, custom_fields = EXCLUDED.custom_fields",
        )
        .bind(recipient.id)
        .bind(recipient.org)
        .bind(recipient.list)
        .bind(&recipient.email)
        .bind(&recipient.email_hash)
        .bind(serde_json::to_value(recipient.status).map_err(|e| AppError::Internal(e.into()))?)
        .bind(recipient.engagement_score)
        .bind(recipient.last_open_at)
        .bind(recipient.last_click_at)
        .bind(recipient.total_sent)
        .bind(recipient.total_opens)
        .bind(recipient.total_clicks)
        .bind(recipient.total_bounces)
        .bind(recipient.total_complaints)
        .bind(recipient.optimal_send_hour.map(i16::from))
        .bind(recipient.optimal_send_day.map(i16::from))
        .bind(&recipient.custom_fields)
        .execute(&self.pool)
        .await?;
        Ok(recipient)
    }

    async fn list_recipients(&self, org: Uuid) -> Result<Vec<Recipient>, AppError> {
        let rows = sqlx::query("SELECT * FROM mailing_recipients WHERE org_id = $1")
            .bind(org)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_recipient).collect()
    }

    async fn list_recipients_by_list(&self, org: Uuid, list: Uuid) -> Result<Vec<Recipient>, AppError> {
        let rows = sqlx::query(
            "SELECT * FROM mailing_recipients WHERE org_id = $1 AND list_id = $2 AND status = 'confirmed' ORDER BY id",
        )
        .bind(org)
        .bind(list)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_recipient).collect()
    }

    async fn find_recipient_by_email(&self, org: Uuid, email: &str) -> Result<Option<Recipient>, AppError> {
        let row = sqlx::query("SELECT * FROM mailing_recipients WHERE org_id = $1 AND email = $2")
            .bind(org)
            .bind(email.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_recipient).transpose()
    }

    async fn get_segment_predicate(&self, org: Uuid, segment: Uuid) -> Result<SegmentPredicate, AppError> {
        let row = sqlx::query("SELECT predicate FROM mailing_segments WHERE id = $1 AND org_id = $2")
            .bind(segment)
            .bind(org)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("segment {segment}")))?;
        let predicate: serde_json::Value = row.try_get("predicate")?;
        serde_json::from_value(predicate).map_err(|e| AppError::Internal(e.into()))
    }

    async fn list_suppressions(&self, org: Uuid) -> Result<Vec<SuppressionEntry>, AppError> {
        let rows = sqlx::query("SELECT * FROM mailing_suppressions WHERE org_id = $1")
            .bind(org)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_suppression).collect()
    }

    async fn add_suppression(&self, entry: SuppressionEntry) -> Result<SuppressionEntry, AppError> {
        sqlx::query(
            "INSERT INTO mailing_suppressions (id, org_id, scope, value, reason, source, active, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(entry.id)
        .bind(entry.org)
        .bind(serde_json::to_value(entry.scope).map_err(|e| AppError::Internal(e.into()))?)
        .bind(&entry.value)
        .bind(serde_json::to_value(entry.reason).map_err(|e| AppError::Internal(e.into()))?)
        .bind(&entry.source)
        .bind(entry.active)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn remove_suppression(&self, org: Uuid, scope: SuppressionScope, value: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE mailing_suppressions SET active = false WHERE org_id = $1 AND scope = $2 AND value = $3",
        )
        .bind(org)
        .bind(serde_json::to_value(scope).map_err(|e| AppError::Internal(e.into()))?)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn suppress_and_record(
        &self,
        entry: SuppressionEntry,
        event: TrackingEvent,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO mailing_suppressions (id, org_id, scope, value, reason, source, active, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(entry.id)
        .bind(entry.org)
        .bind(serde_json::to_value(entry.scope).map_err(|e| AppError::Internal(e.into()))?)
        .bind(&entry.value)
        .bind(serde_json::to_value(entry.reason).map_err(|e| AppError::Internal(e.into()))?)
        .bind(&entry.source)
        .bind(entry.active)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO mailing_tracking_events (id, campaign_id, recipient_id, email_id, kind, occurred_at, metadata)
             VALUES ($1,$2,$3,$4,$5,$6,$7)
             ON CONFLICT (campaign_id, email_id, kind) DO NOTHING",
        )
        .bind(event.id)
        .bind(event.campaign)
        .bind(event.recipient)
        .bind(&event.email_id)
        .bind(serde_json::to_value(event.kind).map_err(|e| AppError::Internal(e.into()))?)
        .bind(event.occurred_at)
        .bind(serde_json::to_value(&event.metadata).map_err(|e| AppError::Internal(e.into()))?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_ab_test(&self, org: Uuid, id: Uuid) -> Result<AbTest, AppError> {
        let row = sqlx::query("SELECT * FROM mailing_ab_tests WHERE id = $1 AND org_id = $2")
            .bind(id)
            .bind(org)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("ab_test {id}")))?;
        row_to_ab_test(&row)
    }

    async fn upsert_ab_test(&self, test: AbTest) -> Result<AbTest, AppError> {
        sqlx::query(
            "INSERT INTO mailing_ab_tests (id, org_id, document) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET document = EXCLUDED.document",
        )
        .bind(test.id)
        .bind(test.org)
        .bind(serde_json::to_value(&test).map_err(|e| AppError::Internal(e.into()))?)
        .execute(&self.pool)
        .await?;
        Ok(test)
    }

    async fn list_ab_tests(&self, org: Uuid) -> Result<Vec<AbTest>, AppError> {
        let rows = sqlx::query("SELECT * FROM mailing_ab_tests WHERE org_id = $1")
            .bind(org)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_ab_test).collect()
    }

    async fn insert_assignments(&self, assignments: Vec<Assignment>) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        for assignment in assignments {
            sqlx::query(
                "INSERT INTO mailing_assignments (test_id, variant_id, recipient_id, cohort, status, sent_at)
                 VALUES ($1,$2,$3,$4,$5,$6)
                 ON CONFLICT (test_id, recipient_id) DO NOTHING",
            )
            .bind(assignment.test)
            .bind(assignment.variant)
            .bind(assignment.recipient)
            .bind(serde_json::to_value(assignment.cohort).map_err(|e| AppError::Internal(e.into()))?)
            .bind(serde_json::to_value(assignment.status).map_err(|e| AppError::Internal(e.into()))?)
            .bind(assignment.sent_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_assignment(&self, test: Uuid, recipient: Uuid) -> Result<Option<Assignment>, AppError> {
        let row = sqlx::query(
            "SELECT * FROM mailing_assignments WHERE test_id = $1 AND recipient_id = $2",
        )
        .bind(test)
        .bind(recipient)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_assignment).transpose()
    }

    async fn list_assignments(&self, test: Uuid) -> Result<Vec<Assignment>, AppError> {
        let rows = sqlx::query("SELECT * FROM mailing_assignments WHERE test_id = $1")
            .bind(test)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_assignment).collect()
    }

    async fn mark_assignment_sent(&self, test: Uuid, recipient: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE mailing_assignments SET status = 'sent', sent_at = now()
             WHERE test_id = $1 AND recipient_id = $2",
        )
        .bind(test)
        .bind(recipient)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_event(&self, event: TrackingEvent) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT INTO mailing_tracking_events (id, campaign_id, recipient_id, email_id, kind, occurred_at, metadata)
             VALUES ($1,$2,$3,$4,$5,$6,$7)
             ON CONFLICT (campaign_id, email_id, kind) DO NOTHING",
        )
        .bind(event.id)
        .bind(event.campaign)
        .bind(event.recipient)
        .bind(&event.email_id)
        .bind(serde_json::to_value(event.kind).map_err(|e| AppError::Internal(e.into()))?)
        .bind(event.occurred_at)
        .bind(serde_json::to_value(&event.metadata).map_err(|e| AppError::Internal(e.into()))?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_events(&self, campaign: Uuid) -> Result<Vec<TrackingEvent>, AppError> {
        let rows = sqlx::query("SELECT * FROM mailing_tracking_events WHERE campaign_id = $1")
            .bind(campaign)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_tracking_event).collect()
    }

    async fn has_event(
        &self,
        campaign: Uuid,
        recipient: Uuid,
        kind: TrackingEventKind,
    ) -> Result<bool, AppError> {
        let row = sqlx::query(
            "SELECT count(*) AS n FROM mailing_tracking_events
             WHERE campaign_id = $1 AND recipient_id = $2 AND kind = $3",
        )
        .bind(campaign)
        .bind(recipient)
        .bind(serde_json::to_value(kind).map_err(|e| AppError::Internal(e.into()))?)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }
}

fn row_to_recipient(row: &sqlx::postgres::PgRow) -> Result<Recipient, AppError> {
    let status: serde_json::Value = row.try_get("status")?;
    let optimal_send_hour: Option<i16> = row.try_get("optimal_send_hour")?;
    let optimal_send_day: Option<i16> = row.try_get("optimal_send_day")?;
    Ok(Recipient {
        id: row.try_get("id")?,
        org: row.try_get("org_id")?,
        list: row.try_get("list_id")?,
        email: row.try_get("email")?,
        email_hash: row.try_get("email_hash")?,
        status: serde_json::from_value(status).map_err(|e| AppError::Internal(e.into()))?,
        engagement_score: row.try_get("engagement_score")?,
        last_open_at: row.try_get("last_open_at")?,
        last_click_at: row.try_get("last_click_at")?,
        total_sent: row.try_get("total_sent")?,
        total_opens: row.try_get("total_opens")?,
        total_clicks: row.try_get("total_clicks")?,
        total_bounces: row.try_get("total_bounces")?,
        total_complaints: row.try_get("total_complaints")?,
        optimal_send_hour: optimal_send_hour.map(|v| v as u8),
        optimal_send_day: optimal_send_day.map(|v| v as u8),
        custom_fields: row.try_get("custom_fields")?,
    })
}

fn row_to_suppression(row: &sqlx::postgres::PgRow) -> Result<SuppressionEntry, AppError> {
    let scope: serde_json::Value = row.try_get("scope")?;
    let reason: serde_json::Value = row.try_get("reason")?;
    Ok(SuppressionEntry {
        id: row.try_get("id")?,
        org: row.try_get("org_id")?,
        scope: serde_json::from_value(scope).map_err(|e| AppError::Internal(e.into()))?,
        value: row.try_get("value")?,
        reason: serde_json::from_value(reason).map_err(|e| AppError::Internal(e.into()))?,
        source: row.try_get("source")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_ab_test(row: &sqlx::postgres::PgRow) -> Result<AbTest, AppError> {
    let document: serde_json::Value = row.try_get("document")?;
    serde_json::from_value(document).map_err(|e| AppError::Internal(e.into()))
}

fn row_to_assignment(row: &sqlx::postgres::PgRow) -> Result<Assignment, AppError> {
    let cohort: serde_json::Value = row.try_get("cohort")?;
    let status: serde_json::Value = row.try_get("status")?;
    Ok(Assignment {
        test: row.try_get("test_id")?,
        variant: row.try_get("variant_id")?,
        recipient: row.try_get("recipient_id")?,
        cohort: serde_json::from_value(cohort).map_err(|e| AppError::Internal(e.into()))?,
        status: serde_json::from_value(status).map_err(|e| AppError::Internal(e.into()))?,
        sent_at: row.try_get("sent_at")?,
    })
}

fn row_to_tracking_event(row: &sqlx::postgres::PgRow) -> Result<TrackingEvent, AppError> {
    let kind: serde_json::Value = row.try_get("kind")?;
    let metadata: serde_json::Value = row.try_get("metadata")?;
    Ok(TrackingEvent {
        id: row.try_get("id")?,
        campaign: row.try_get("campaign_id")?,
        recipient: row.try_get("recipient_id")?,
        email_id: row.try_get("email_id")?,
        kind: serde_json::from_value(kind).map_err(|e| AppError::Internal(e.into()))?,
        occurred_at: row.try_get("occurred_at")?,
        metadata: serde_json::from_value(metadata).map_err(|e| AppError::Internal(e.into()))?,
    })
}
