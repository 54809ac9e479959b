//! Profil-Cache

use super::{CallDatabase, DatabaseError};
use crate::profiles::Profile;
use rusqlite::params;

impl CallDatabase {
    /// Fügt ein Profil ein oder aktualisiert es
    pub fn upsert_profile(&self, profile: &Profile) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO profiles (user_id, display_name, photo_url)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id) DO UPDATE SET
                display_name = excluded.display_name,
                photo_url = excluded.photo_url,
                updated_at = datetime('now')
            "#,
            params![profile.user_id, profile.display_name, profile.photo_url],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Profile, DatabaseError> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
            SELECT user_id, display_name, photo_url
            FROM profiles
            WHERE user_id = ?1
            "#,
            params![user_id],
            |row| {
                Ok(Profile {
                    user_id: row.get(0)?,
                    display_name: row.get(1)?,
                    photo_url: row.get(2)?,
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DatabaseError::NotFound(user_id.to_string()),
            other => DatabaseError::Sqlite(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_get_profile() {
        let db = CallDatabase::open_in_memory().unwrap();

        let mut profile = Profile {
            user_id: "alice".to_string(),
            display_name: "Alice".to_string(),
            photo_url: Some("https://img/a.png".to_string()),
        };
        db.upsert_profile(&profile).unwrap();
        assert_eq!(db.get_profile("alice").unwrap(), profile);

        profile.display_name = "Alice B.".to_string();
        profile.photo_url = None;
        db.upsert_profile(&profile).unwrap();
        assert_eq!(db.get_profile("alice").unwrap(), profile);
    }

    #[test]
    fn test_missing_profile_is_not_found() {
        let db = CallDatabase::open_in_memory().unwrap();
        assert!(matches!(db.get_profile("ghost"), Err(DatabaseError::NotFound(_))));
    }
}
