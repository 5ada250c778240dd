use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

pub use super::schema;

pub use super::schema::{
    areas, environments, notifications, ticket_interactions, tickets, user_groups, users,
};

/// A portal account: either a customer who files tickets or a member of the
/// support team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub is_staff: bool,
    pub is_active: bool,
    pub location: Option<String>,
    pub person_id: Option<String>,
    pub groups: Vec<String>,
}

impl User {
    /// Name shown to other people: first name, falling back to the username.
    pub fn display_name(&self) -> &str {
        if self.first_name.trim().is_empty() {
            &self.username
        } else {
            &self.first_name
        }
    }

    pub fn full_name(&self) -> String {
        let full = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub asset_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = users)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub is_staff: bool,
    pub is_active: bool,
    pub location: Option<String>,
    pub person_id: Option<String>,
}

impl UserRow {
    pub fn into_user(self, groups: Vec<String>) -> User {
        User {
            id: self.id,
            username: self.username,
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            is_staff: self.is_staff,
            is_active: self.is_active,
            location: self.location,
            person_id: self.person_id,
            groups,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUserRow<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub is_staff: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = environments)]
pub struct EnvironmentRow {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub asset_number: String,
}

impl From<EnvironmentRow> for Environment {
    fn from(row: EnvironmentRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            asset_number: row.asset_number,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = areas)]
pub struct AreaRow {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
}

impl From<AreaRow> for Area {
    fn from(row: AreaRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = tickets)]
pub struct TicketRow {
    pub id: i64,
    pub owner_id: i64,
    pub external_id: Option<String>,
    pub summary: String,
    pub description: String,
    pub status: String,
    pub priority: Option<i16>,
    pub environment_id: Option<i64>,
    pub area_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tickets)]
pub struct NewTicketRow<'a> {
    pub owner_id: i64,
    pub summary: &'a str,
    pub description: &'a str,
    pub status: &'a str,
    pub priority: Option<i16>,
    pub environment_id: Option<i64>,
    pub area_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = ticket_interactions)]
pub struct InteractionRow {
    pub id: i64,
    pub ticket_id: i64,
    pub author_id: i64,
    pub body: String,
    pub attachment_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = ticket_interactions)]
pub struct NewInteractionRow<'a> {
    pub ticket_id: i64,
    pub author_id: i64,
    pub body: &'a str,
    pub attachment_name: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = notifications)]
pub struct NotificationRow {
    pub id: i64,
    pub recipient_id: i64,
    pub ticket_id: Option<i64>,
    pub kind: String,
    pub title: String,
    pub preview: String,
    pub link: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = notifications)]
pub struct NewNotificationRow<'a> {
    pub recipient_id: i64,
    pub ticket_id: Option<i64>,
    pub kind: &'a str,
    pub title: &'a str,
    pub preview: &'a str,
    pub link: &'a str,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(first: &str, last: &str) -> User {
        User {
            id: 1,
            username: "jdoe".to_string(),
            email: "jdoe@example.com".to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            is_staff: false,
            is_active: true,
            location: None,
            person_id: None,
            groups: vec!["Consultants".to_string()],
        }
    }

    #[test]
    fn test_display_name_falls_back_to_username() {
        assert_eq!(user("Jane", "Doe").display_name(), "Jane");
        assert_eq!(user("  ", "").display_name(), "jdoe");
    }

    #[test]
    fn test_full_name() {
        assert_eq!(user("Jane", "Doe").full_name(), "Jane Doe");
        assert_eq!(user("", "").full_name(), "jdoe");
    }

    #[test]
    fn test_in_group_is_exact() {
        let u = user("Jane", "Doe");
        assert!(u.in_group("Consultants"));
        assert!(!u.in_group("consultants"));
    }
}
