//! Collected-lead persistence, keyed by (account, end-user).

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use dmflow_core::error::Result;
use dmflow_core::types::{AccountId, CollectedLead};

use crate::store::{db_err, ts, SqliteStore};

impl SqliteStore {
    /// Merge collected fields into the lead row for (account, igsid),
    /// creating it on first contact. Only fields present in `lead`
    /// overwrite; absent fields keep their stored value.
    pub fn upsert_lead(&self, lead: &CollectedLead) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let now = ts(Utc::now());

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, custom FROM leads WHERE account_id = ?1 AND igsid = ?2",
                params![lead.account.0, lead.igsid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;

        match existing {
            Some((id, stored_custom)) => {
                let mut custom: HashMap<String, String> =
                    serde_json::from_str(&stored_custom).unwrap_or_default();
                custom.extend(lead.custom.iter().map(|(k, v)| (k.clone(), v.clone())));

                tx.execute(
                    "UPDATE leads SET
                        username = ?1,
                        name = COALESCE(?2, name),
                        email = COALESCE(?3, email),
                        phone = COALESCE(?4, phone),
                        custom = ?5,
                        is_follower = COALESCE(?6, is_follower),
                        updated_at = ?7
                     WHERE id = ?8",
                    params![
                        lead.username,
                        lead.name,
                        lead.email,
                        lead.phone,
                        serde_json::to_string(&custom)?,
                        lead.is_follower,
                        now,
                        id,
                    ],
                )
                .map_err(db_err)?;
            }
            None => {
                tx.execute(
                    "INSERT INTO leads
                        (account_id, igsid, username, name, email, phone, custom,
                         is_follower, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        lead.account.0,
                        lead.igsid,
                        lead.username,
                        lead.name,
                        lead.email,
                        lead.phone,
                        serde_json::to_string(&lead.custom)?,
                        lead.is_follower,
                        now,
                    ],
                )
                .map_err(db_err)?;
            }
        }

        tx.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn load_lead(&self, account: AccountId, igsid: &str) -> Result<Option<CollectedLead>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT igsid, username, name, email, phone, custom, is_follower
             FROM leads WHERE account_id = ?1 AND igsid = ?2",
            params![account.0, igsid],
            |row| {
                let custom: String = row.get(5)?;
                Ok(CollectedLead {
                    account,
                    igsid: row.get(0)?,
                    username: row.get(1)?,
                    name: row.get(2)?,
                    email: row.get(3)?,
                    phone: row.get(4)?,
                    custom: serde_json::from_str(&custom).unwrap_or_default(),
                    is_follower: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_merges_fields() {
        let store = SqliteStore::in_memory().unwrap();
        let account = store.create_account("shop", "ig_1", "tok").unwrap();

        let mut first = CollectedLead {
            account,
            igsid: "u1".into(),
            username: "jo".into(),
            email: Some("jo@example.com".into()),
            ..Default::default()
        };
        first.custom.insert("color".into(), "blue".into());
        store.upsert_lead(&first).unwrap();

        // Second pass fills in phone but leaves email alone.
        let mut second = CollectedLead {
            account,
            igsid: "u1".into(),
            username: "jo".into(),
            phone: Some("+4915511223344".into()),
            ..Default::default()
        };
        second.custom.insert("size".into(), "m".into());
        store.upsert_lead(&second).unwrap();

        let lead = store.load_lead(account, "u1").unwrap().unwrap();
        assert_eq!(lead.email.as_deref(), Some("jo@example.com"));
        assert_eq!(lead.phone.as_deref(), Some("+4915511223344"));
        assert_eq!(lead.custom["color"], "blue");
        assert_eq!(lead.custom["size"], "m");
    }
}
