use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{query, Executor, PgPool, Postgres, Row};
use tokio_stream::StreamExt;

use crate::db::schema::{Entrant, Entry, Exclusions, NewPoll, Poll, PollId, PollResult, RecentWinnerRule, Slot, SlotCapacity, UserId};
use crate::db::store::{DrawInput, DrawRecord, EntryInsert, FcfsAdmission, Rejection, WinnerSelector};

const POLL_COLUMNS: &str = "id, time_created, id_owner, title, description, \
    capacity_morning, capacity_afternoon, capacity_full_day, closes_at, policy, \
    open, drawn, excluded_user_ids, recent_winner_window";

fn poll_from_row(r: &PgRow) -> anyhow::Result<Poll> {
    let window: Option<String> = r.try_get("recent_winner_window")?;
    let recent_winners = match window {
        None => RecentWinnerRule::Off,
        Some(w) => RecentWinnerRule::Within(w.parse()?),
    };
    let excluded: Vec<i32> = r.try_get("excluded_user_ids")?;

    Ok(Poll {
        id: r.try_get("id")?,
        time_created: r.try_get("time_created")?,
        id_owner: r.try_get("id_owner")?,
        title: r.try_get("title")?,
        description: r.try_get("description")?,
        capacity: SlotCapacity {
            morning: r.try_get::<i32, _>("capacity_morning")? as u32,
            afternoon: r.try_get::<i32, _>("capacity_afternoon")? as u32,
            full_day: r.try_get::<i32, _>("capacity_full_day")? as u32,
        },
        closes_at: r.try_get("closes_at")?,
        policy: r.try_get::<String, _>("policy")?.parse()?,
        open: r.try_get("open")?,
        drawn: r.try_get("drawn")?,
        exclusions: Exclusions {
            excluded_user_ids: excluded.into_iter().collect(),
            recent_winners,
        },
    })
}

fn entry_from_row(r: &PgRow) -> anyhow::Result<Entry> {
    Ok(Entry {
        id_poll: r.try_get("id_poll")?,
        id_user: r.try_get("id_user")?,
        slot: r.try_get::<String, _>("slot")?.parse::<Slot>()?,
        time_created: r.try_get("time_created")?,
    })
}

fn result_from_row(r: &PgRow) -> anyhow::Result<PollResult> {
    Ok(PollResult {
        id_poll: r.try_get("id_poll")?,
        id_user: r.try_get("id_user")?,
        slot: r.try_get::<String, _>("slot")?.parse::<Slot>()?,
        time_created: r.try_get("time_created")?,
    })
}

fn entrant_from_row(r: &PgRow) -> anyhow::Result<Entrant> {
    Ok(Entrant {
        id: r.try_get("id")?,
        name: r.try_get("name")?,
        pin: r.try_get::<String, _>("pin")?.trim().to_owned(),
    })
}

pub async fn add_poll(
    conn: &PgPool,
    id_owner: UserId,
    poll: &NewPoll,
    now: DateTime<Utc>,
) -> anyhow::Result<Poll> {
    let excluded: Vec<i32> = poll.exclusions.excluded_user_ids.iter().copied().collect();

    let r = query(&format!(
        "INSERT INTO poll (time_created, id_owner, title, description, capacity_morning, capacity_afternoon,
                           capacity_full_day, closes_at, policy, open, drawn, excluded_user_ids, recent_winner_window)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE, FALSE, $10, $11)
         RETURNING {};", POLL_COLUMNS))
        .bind(now)
        .bind(id_owner)
        .bind(&poll.title)
        .bind(&poll.description)
        .bind(poll.capacity.morning as i32)
        .bind(poll.capacity.afternoon as i32)
        .bind(poll.capacity.full_day as i32)
        .bind(poll.closes_at)
        .bind(poll.policy.as_str())
        .bind(excluded)
        .bind(poll.exclusions.recent_winners.window().map(|w| w.as_str()))
        .fetch_one(conn)
        .await?;

    poll_from_row(&r)
}

pub async fn get_poll(conn: &PgPool, id_poll: PollId) -> anyhow::Result<Option<Poll>> {
    let r = query(&format!("SELECT {} FROM poll WHERE id=$1;", POLL_COLUMNS))
        .bind(id_poll)
        .fetch_optional(conn)
        .await?;

    match r {
        None => Ok(None),
        Some(v) => Ok(Some(poll_from_row(&v)?)),
    }
}

pub async fn list_pending_polls(conn: &PgPool) -> anyhow::Result<Vec<Poll>> {
    let sql = format!("SELECT {} FROM poll WHERE drawn=FALSE ORDER BY closes_at;", POLL_COLUMNS);
    let mut stream = query(&sql).fetch(conn);

    let mut result = Vec::new();
    while let Some(row) = stream.try_next().await? {
        result.push(poll_from_row(&row)?);
    }

    Ok(result)
}

pub async fn get_entry(conn: &PgPool, id_poll: PollId, id_user: UserId) -> anyhow::Result<Option<Entry>> {
    let r = query("SELECT * FROM entry WHERE id_poll=$1 AND id_user=$2;")
        .bind(id_poll)
        .bind(id_user)
        .fetch_optional(conn)
        .await?;

    match r {
        None => Ok(None),
        Some(v) => Ok(Some(entry_from_row(&v)?)),
    }
}

pub async fn list_entries<'e, E>(conn: E, id_poll: PollId) -> anyhow::Result<Vec<Entry>>
where
    E: Executor<'e, Database = Postgres>,
{
    let mut stream = query("SELECT * FROM entry WHERE id_poll=$1 ORDER BY time_created, id_user;")
        .bind(id_poll)
        .fetch(conn);

    let mut result = Vec::new();
    while let Some(row) = stream.try_next().await? {
        result.push(entry_from_row(&row)?);
    }

    Ok(result)
}

pub async fn list_results<'e, E>(conn: E, id_poll: PollId) -> anyhow::Result<Vec<PollResult>>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows = query("SELECT * FROM result WHERE id_poll=$1 ORDER BY time_created, id_user;")
        .bind(id_poll)
        .fetch_all(conn)
        .await?;

    rows.iter().map(result_from_row).collect()
}

pub async fn recent_winners<'e, E>(
    conn: E,
    id_owner: UserId,
    since: DateTime<Utc>,
    excluding: Option<PollId>,
) -> anyhow::Result<HashSet<UserId>>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows = query(
        "SELECT DISTINCT r.id_user FROM result r
         JOIN poll p ON p.id = r.id_poll
         WHERE p.id_owner=$1 AND r.time_created >= $2 AND ($3::INTEGER IS NULL OR r.id_poll <> $3);")
        .bind(id_owner)
        .bind(since)
        .bind(excluding)
        .fetch_all(conn)
        .await?;

    let mut result = HashSet::new();
    for row in rows {
        result.insert(row.try_get::<i32, _>("id_user")?);
    }

    Ok(result)
}

pub async fn count_entrants(conn: &PgPool) -> anyhow::Result<i64> {
    let r = query("SELECT COUNT(*) AS total FROM entrant;")
        .fetch_one(conn)
        .await?;

    Ok(r.try_get("total")?)
}

pub async fn add_entrant(conn: &PgPool, name: &str, pin: &str) -> anyhow::Result<Entrant> {
    let r = query("INSERT INTO entrant (name, pin) VALUES ($1, $2) RETURNING id, name, pin;")
        .bind(name)
        .bind(pin)
        .fetch_one(conn)
        .await?;

    entrant_from_row(&r)
}

pub async fn get_entrant(conn: &PgPool, id_user: UserId) -> anyhow::Result<Option<Entrant>> {
    let r = query("SELECT id, name, pin FROM entrant WHERE id=$1;")
        .bind(id_user)
        .fetch_optional(conn)
        .await?;

    match r {
        None => Ok(None),
        Some(v) => Ok(Some(entrant_from_row(&v)?)),
    }
}

pub async fn insert_random_entry(
    conn: &PgPool,
    id_poll: PollId,
    id_user: UserId,
    slot: Slot,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<EntryInsert>> {
    let mut tx = conn.begin().await?;

    // FOR SHARE conflicts with the draw's FOR UPDATE, so no entry lands on a
    // poll that is being drawn.
    let poll = query(&format!("SELECT {} FROM poll WHERE id=$1 FOR SHARE;", POLL_COLUMNS))
        .bind(id_poll)
        .fetch_optional(&mut tx)
        .await?;
    let poll = match poll {
        None => return Ok(None),
        Some(v) => poll_from_row(&v)?,
    };
    if !poll.accepts_entries(now) {
        return Ok(Some(EntryInsert::Rejected(Rejection::PollClosed)));
    }

    let inserted = query(
        "INSERT INTO entry (id_poll, id_user, slot, time_created)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (id_poll, id_user) DO NOTHING
         RETURNING *;")
        .bind(id_poll)
        .bind(id_user)
        .bind(slot.as_str())
        .bind(now)
        .fetch_optional(&mut tx)
        .await?;

    let entry = match inserted {
        None => return Ok(Some(EntryInsert::Rejected(Rejection::AlreadyEntered))),
        Some(v) => entry_from_row(&v)?,
    };

    tx.commit().await?;

    Ok(Some(EntryInsert::Inserted(entry)))
}

pub async fn try_admit_fcfs(
    conn: &PgPool,
    id_poll: PollId,
    id_user: UserId,
    slot: Slot,
    capacity: u32,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<FcfsAdmission>> {
    let mut tx = conn.begin().await?;

    let poll = query(&format!("SELECT {} FROM poll WHERE id=$1 FOR UPDATE;", POLL_COLUMNS))
        .bind(id_poll)
        .fetch_optional(&mut tx)
        .await?;
    let poll = match poll {
        None => return Ok(None),
        Some(v) => poll_from_row(&v)?,
    };
    if !poll.accepts_entries(now) {
        return Ok(Some(FcfsAdmission::rejected(Rejection::PollClosed, poll.drawn)));
    }

    let entered = query("SELECT 1 FROM entry WHERE id_poll=$1 AND id_user=$2;")
        .bind(id_poll)
        .bind(id_user)
        .fetch_optional(&mut tx)
        .await?;
    if entered.is_some() {
        return Ok(Some(FcfsAdmission::rejected(Rejection::AlreadyEntered, false)));
    }

    let taken: i64 = query("SELECT COUNT(*) AS taken FROM result WHERE id_poll=$1 AND slot=$2;")
        .bind(id_poll)
        .bind(slot.as_str())
        .fetch_one(&mut tx)
        .await?
        .try_get("taken")?;
    if taken >= capacity as i64 {
        return Ok(Some(FcfsAdmission::rejected(Rejection::SlotFull, false)));
    }

    let inserted = query(
        "INSERT INTO entry (id_poll, id_user, slot, time_created)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (id_poll, id_user) DO NOTHING
         RETURNING id_user;")
        .bind(id_poll)
        .bind(id_user)
        .bind(slot.as_str())
        .bind(now)
        .fetch_optional(&mut tx)
        .await?;
    if inserted.is_none() {
        return Ok(Some(FcfsAdmission::rejected(Rejection::AlreadyEntered, false)));
    }

    query("INSERT INTO result (id_poll, id_user, slot, time_created) VALUES ($1, $2, $3, $4);")
        .bind(id_poll)
        .bind(id_user)
        .bind(slot.as_str())
        .bind(now)
        .execute(&mut tx)
        .await?;

    let filled: i64 = query("SELECT COUNT(*) AS filled FROM result WHERE id_poll=$1;")
        .bind(id_poll)
        .fetch_one(&mut tx)
        .await?
        .try_get("filled")?;
    let poll_full = filled >= poll.capacity.total() as i64;
    if poll_full {
        query("UPDATE poll SET open=FALSE, drawn=TRUE WHERE id=$1;")
            .bind(id_poll)
            .execute(&mut tx)
            .await?;
    }

    tx.commit().await?;

    Ok(Some(FcfsAdmission::admitted(poll_full)))
}

pub async fn draw_random_winners(
    conn: &PgPool,
    id_poll: PollId,
    now: DateTime<Utc>,
    select: &dyn WinnerSelector,
) -> anyhow::Result<Option<DrawRecord>> {
    let mut tx = conn.begin().await?;

    let poll = query(&format!("SELECT {} FROM poll WHERE id=$1 FOR UPDATE;", POLL_COLUMNS))
        .bind(id_poll)
        .fetch_optional(&mut tx)
        .await?;
    let mut poll = match poll {
        None => return Ok(None),
        Some(v) => poll_from_row(&v)?,
    };

    if poll.drawn {
        let results = list_results(&mut tx, id_poll).await?;
        tx.commit().await?;

        return Ok(Some(DrawRecord { poll, results, newly_drawn: false }));
    }

    let entries = list_entries(&mut tx, id_poll).await?;
    let recent = match poll.exclusions.recent_winners.since(now) {
        None => HashSet::new(),
        Some(since) => recent_winners(&mut tx, poll.id_owner, since, Some(id_poll)).await?,
    };

    let winners = select.select(&DrawInput {
        poll: &poll,
        entries: &entries,
        recent_winners: &recent,
    });

    for (id_user, slot) in &winners {
        query("INSERT INTO result (id_poll, id_user, slot, time_created) VALUES ($1, $2, $3, $4);")
            .bind(id_poll)
            .bind(*id_user)
            .bind(slot.as_str())
            .bind(now)
            .execute(&mut tx)
            .await?;
    }

    query("UPDATE poll SET open=FALSE, drawn=TRUE WHERE id=$1;")
        .bind(id_poll)
        .execute(&mut tx)
        .await?;

    let results = list_results(&mut tx, id_poll).await?;
    tx.commit().await?;

    poll.open = false;
    poll.drawn = true;

    Ok(Some(DrawRecord { poll, results, newly_drawn: true }))
}
