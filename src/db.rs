use crate::calendar::{
    new_booking_ref, replay, Availability, AvailabilitySlot, BookingRequest, BookingResult,
    BusinessHours, CalendarBackend, CalendarError, Interval,
};
use crate::session::CallSession;
use crate::session_store::{SessionStore, StoreError};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::types::time::{Date, OffsetDateTime, PrimitiveDateTime, Time};
use sqlx::Executor;
use time::Duration;
use tracing::{debug, error, info};

#[derive(sqlx::FromRow)]
struct SessionRow {
    body: String,
}

#[derive(sqlx::FromRow)]
struct BusyRow {
    starts_at: PrimitiveDateTime,
    ends_at: PrimitiveDateTime,
}

#[derive(sqlx::FromRow)]
struct KeyedBookingRow {
    booking_ref: String,
    starts_at: PrimitiveDateTime,
    ends_at: PrimitiveDateTime,
}

impl KeyedBookingRow {
    fn replay(self, request: &BookingRequest) -> BookingResult {
        let stored = Interval {
            start: self.starts_at,
            end: self.ends_at,
        };
        replay(self.booking_ref, stored, request)
    }
}

fn store_error(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!(error=%e, "{context}");
        StoreError::Backend(format!("{context}: {e}"))
    }
}

fn calendar_error(context: &'static str) -> impl Fn(sqlx::Error) -> CalendarError {
    move |e| {
        error!(error=%e, "{context}");
        CalendarError::Backend(format!("{context}: {e}"))
    }
}

fn decode_session(row: SessionRow) -> Result<CallSession, StoreError> {
    serde_json::from_str(&row.body).map_err(|e| {
        error!(error=%e, "stored session does not decode");
        StoreError::Backend(format!("stored session does not decode: {e}"))
    })
}

/// A version-guarded write that touched no row lost the race to another writer.
fn guarded_write(rows_affected: u64, call_id: &str) -> Result<(), StoreError> {
    if rows_affected == 0 {
        debug!(call_id, "session version moved, write refused");
        return Err(StoreError::Conflict {
            call_id: call_id.to_string(),
        });
    }
    Ok(())
}

/// Sessions in the `call_sessions` table, one JSON row per call.
pub struct PgSessionStore {
    pool: PgPool,
    ttl: Duration,
}

impl PgSessionStore {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn load(&self, call_id: &str) -> Result<Option<CallSession>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            "
            select body::text as body
            from call_sessions
            where call_id = $1
            ",
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error("failed to load session"))?;
        row.map(decode_session).transpose()
    }

    async fn save(&self, session: &mut CallSession) -> Result<(), StoreError> {
        let mut next = session.clone();
        next.version += 1;
        next.expires_at = next.last_active_at + self.ttl;
        let body = serde_json::to_string(&next)
            .map_err(|e| StoreError::Backend(format!("session does not encode: {e}")))?;

        let result = if session.version == 0 {
            sqlx::query(
                "
                insert into call_sessions (
                  call_id,
                  version,
                  state,
                  last_active_at,
                  expires_at,
                  body
                ) values (
                  $1,
                  $2,
                  $3,
                  $4,
                  $5,
                  $6::jsonb
                )
                on conflict (call_id) do nothing
                ",
            )
            .bind(&next.call_id)
            .bind(next.version)
            .bind(next.state().as_str())
            .bind(next.last_active_at)
            .bind(next.expires_at)
            .bind(&body)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                "
                update call_sessions
                set version = $3,
                    state = $4,
                    last_active_at = $5,
                    expires_at = $6,
                    body = $7::jsonb
                where call_id = $1
                  and version = $2
                ",
            )
            .bind(&next.call_id)
            .bind(session.version)
            .bind(next.version)
            .bind(next.state().as_str())
            .bind(next.last_active_at)
            .bind(next.expires_at)
            .bind(&body)
            .execute(&self.pool)
            .await
        }
        .map_err(store_error("failed to save session"))?;

        guarded_write(result.rows_affected(), &session.call_id)?;
        *session = next;
        Ok(())
    }

    async fn delete(&self, call_id: &str) -> Result<(), StoreError> {
        sqlx::query("delete from call_sessions where call_id = $1")
            .bind(call_id)
            .execute(&self.pool)
            .await
            .map_err(store_error("failed to delete session"))?;
        Ok(())
    }

    async fn delete_if_unchanged(&self, call_id: &str, version: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("delete from call_sessions where call_id = $1 and version = $2")
            .bind(call_id)
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(store_error("failed to delete session"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn idle_since(&self, cutoff: OffsetDateTime) -> Result<Vec<CallSession>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "
            select body::text as body
            from call_sessions
            where last_active_at < $1
            ",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error("failed to list idle sessions"))?;
        rows.into_iter().map(decode_session).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.pool
            .execute("select 1")
            .await
            .map_err(store_error("session store ping failed"))?;
        Ok(())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Bookings in the `bookings` table. Writes for one day are serialized by an advisory lock
/// so the overlap check and the insert cannot interleave between concurrent calls.
pub struct PgCalendar {
    pool: PgPool,
    hours: BusinessHours,
}

impl PgCalendar {
    pub fn new(pool: PgPool, hours: BusinessHours) -> Self {
        Self { pool, hours }
    }
}

async fn busy_on<'e, E>(executor: E, date: Date) -> Result<Vec<Interval>, CalendarError>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows = sqlx::query_as::<_, BusyRow>(
        "
        select starts_at, ends_at
        from bookings
        where day = $1
        ",
    )
    .bind(date)
    .fetch_all(executor)
    .await
    .map_err(calendar_error("failed to read bookings"))?;
    Ok(rows
        .into_iter()
        .map(|r| Interval {
            start: r.starts_at,
            end: r.ends_at,
        })
        .collect())
}

async fn booking_for_key<'e, E>(
    executor: E,
    key: &str,
) -> Result<Option<KeyedBookingRow>, CalendarError>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, KeyedBookingRow>(
        "
        select booking_ref, starts_at, ends_at
        from bookings
        where idempotency_key = $1
        ",
    )
    .bind(key)
    .fetch_optional(executor)
    .await
    .map_err(calendar_error("failed to look up booking key"))
}

#[async_trait]
impl CalendarBackend for PgCalendar {
    async fn check_availability(
        &self,
        date: Date,
        time: Time,
        duration_minutes: u32,
    ) -> Result<Availability, CalendarError> {
        let busy = busy_on(&self.pool, date).await?;
        Ok(self
            .hours
            .availability(date, time, duration_minutes, &busy, self.hours.local_now()))
    }

    async fn free_slots(
        &self,
        date: Date,
        duration_minutes: u32,
    ) -> Result<Vec<AvailabilitySlot>, CalendarError> {
        let busy = busy_on(&self.pool, date).await?;
        Ok(self
            .hours
            .free_slots(date, duration_minutes, &busy, self.hours.local_now()))
    }

    async fn create_booking(&self, request: &BookingRequest) -> Result<BookingResult, CalendarError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(calendar_error("failed to begin transaction"))?;

        sqlx::query("select pg_advisory_xact_lock(hashtext($1))")
            .bind(request.date.to_string())
            .execute(&mut *tx)
            .await
            .map_err(calendar_error("failed to lock booking day"))?;

        if let Some(existing) = booking_for_key(&mut *tx, &request.idempotency_key).await? {
            debug!(key=%request.idempotency_key, booking_ref=%existing.booking_ref, "booking already exists for key");
            return Ok(existing.replay(request));
        }

        let duration = request.service.duration_minutes();
        let busy = busy_on(&mut *tx, request.date).await?;
        let now = self.hours.local_now();
        let interval = request.interval();
        if !self.hours.is_free(&interval, &busy, now) {
            return Ok(BookingResult::Conflict {
                alternatives: self.hours.free_slots(request.date, duration, &busy, now),
            });
        }

        let booking_ref = new_booking_ref();
        let inserted = sqlx::query(
            "
            insert into bookings (
              booking_ref,
              idempotency_key,
              day,
              starts_at,
              ends_at,
              service,
              customer_name,
              caller
            ) values (
              $1,
              $2,
              $3,
              $4,
              $5,
              $6,
              $7,
              $8
            )
            ",
        )
        .bind(&booking_ref)
        .bind(&request.idempotency_key)
        .bind(request.date)
        .bind(interval.start)
        .bind(interval.end)
        .bind(request.service.as_str())
        .bind(&request.customer_name)
        .bind(&request.caller)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            let duplicate_key = e
                .as_database_error()
                .and_then(|d| d.code())
                .is_some_and(|code| code == "23505");
            if !duplicate_key {
                return Err(calendar_error("failed to insert booking")(e));
            }
            // same key booked on another day meanwhile
            drop(tx);
            return match booking_for_key(&self.pool, &request.idempotency_key).await? {
                Some(existing) => Ok(existing.replay(request)),
                None => Err(CalendarError::Backend(format!(
                    "booking key {} collided but is missing",
                    request.idempotency_key
                ))),
            };
        }

        tx.commit()
            .await
            .map_err(calendar_error("failed to commit booking"))?;
        info!(%booking_ref, date=%request.date, time=%request.time, "booked");
        Ok(BookingResult::Booked {
            booking_ref,
            replayed: false,
        })
    }

    async fn ping(&self) -> Result<(), CalendarError> {
        self.pool
            .execute("select 1")
            .await
            .map_err(calendar_error("calendar ping failed"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Service;
    use sqlx::postgres::PgPoolOptions;
    use time::macros::{date, time};

    #[test]
    fn untouched_row_is_a_conflict() {
        assert!(guarded_write(1, "CA1").is_ok());
        assert!(matches!(
            guarded_write(0, "CA1"),
            Err(StoreError::Conflict { call_id }) if call_id == "CA1"
        ));
    }

    async fn pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL for postgres tests");
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .unwrap();
        sqlx::migrate!().run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn stale_session_write_is_refused() {
        let store = PgSessionStore::new(pool().await, Duration::minutes(10));
        let call_id = format!("CA-{}", uuid::Uuid::new_v4());
        let mut session = CallSession::fresh(
            &call_id,
            "+96170000000",
            OffsetDateTime::now_utc(),
            store.ttl(),
        );
        store.save(&mut session).await.unwrap();

        let mut stale = store.load(&call_id).await.unwrap().unwrap();
        session.turn_count = 1;
        store.save(&mut session).await.unwrap();
        stale.turn_count = 5;
        assert!(matches!(
            store.save(&mut stale).await,
            Err(StoreError::Conflict { .. })
        ));
        let stored = store.load(&call_id).await.unwrap().unwrap();
        assert_eq!(stored.turn_count, 1);
        store.delete(&call_id).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn overlapping_bookings_are_refused() {
        let calendar = PgCalendar::new(pool().await, BusinessHours::default());
        // a far-off Monday per run keeps runs apart
        let bytes = *uuid::Uuid::new_v4().as_bytes();
        let day = date!(2031 - 01 - 06)
            + Duration::weeks(i64::from(u16::from_be_bytes([bytes[0], bytes[1]])));
        let request = |key: String, at: Time| BookingRequest {
            idempotency_key: key,
            date: day,
            time: at,
            service: Service::Haircut,
            customer_name: "John".to_string(),
            caller: "+96170000000".to_string(),
        };
        let key = format!("CA-{}", uuid::Uuid::new_v4());
        let first = calendar
            .create_booking(&request(key.clone(), time!(14:00)))
            .await
            .unwrap();
        let BookingResult::Booked { booking_ref, replayed: false } = first else {
            panic!("expected a booking, got {first:?}");
        };

        let replay = calendar
            .create_booking(&request(key.clone(), time!(14:00)))
            .await
            .unwrap();
        assert_eq!(
            replay,
            BookingResult::Booked {
                booking_ref: booking_ref.clone(),
                replayed: true
            }
        );
        let moved = calendar
            .create_booking(&request(key, time!(16:00)))
            .await
            .unwrap();
        assert_eq!(moved, BookingResult::KeyReused { booking_ref });

        let other = calendar
            .create_booking(&request(format!("CA-{}", uuid::Uuid::new_v4()), time!(14:15)))
            .await
            .unwrap();
        assert!(matches!(other, BookingResult::Conflict { .. }));
    }
}
