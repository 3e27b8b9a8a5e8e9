use rocket_db_pools::{Database, sqlx};

#[derive(Database)]
#[database("crm_db")]
pub struct CrmDb(sqlx::PgPool);
