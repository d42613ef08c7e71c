pub const GROUPS_CREATED: &str = "grouper_groups_created";
pub const REPETITIONS_SAVED: &str = "grouper_repetitions_saved";
pub const INSERT_RACES_LOST: &str = "grouper_insert_races_lost";
pub const USERS_AFFECTED: &str = "grouper_users_affected";
pub const NOTIFICATIONS_PUBLISHED: &str = "grouper_notifications_published";
