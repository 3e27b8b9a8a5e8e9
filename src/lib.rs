#[macro_use]
extern crate rocket;

pub mod config;
pub mod database;
pub mod db;
pub mod error;
pub mod import;
pub mod models;
pub mod request_logger;
pub mod routes;

use crate::config::ImportConfig;
use crate::db::CrmDb;
use crate::import::{JobRegistry, LeadImporter, PgLeadRepository, RuleRegistry};
use crate::request_logger::RequestLogger;
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::{Arc, Once};

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

/// Load the rule registry, including `IMPORT_RULES_DIR` when configured.
pub fn load_rules(config: &ImportConfig) -> Result<RuleRegistry, import::rules::RulesError> {
    match &config.rules_dir {
        Some(dir) => RuleRegistry::with_directory(dir),
        None => RuleRegistry::builtin(),
    }
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .allow_credentials(true)
        .to_cors()
        .expect("Error creating CORS");

    rocket::build()
        .attach(RequestLogger)
        .attach(CrmDb::init())
        .attach(cors)
        // Run database migrations on startup
        .attach(AdHoc::try_on_ignite(
            "Run Migrations",
            |rocket| async move {
                match CrmDb::fetch(&rocket) {
                    Some(db) => match database::run_migrations(db).await {
                        Ok(_) => Ok(rocket),
                        Err(e) => {
                            log::error!("database migrations failed: {}", e);
                            Err(rocket)
                        }
                    },
                    None => {
                        log::error!("database pool not available for migrations");
                        Err(rocket)
                    }
                }
            },
        ))
        // Build the import engine over the managed pool
        .attach(AdHoc::try_on_ignite(
            "Import Engine",
            |rocket| async move {
                let Some(db) = CrmDb::fetch(&rocket) else {
                    log::error!("database pool not available for the import engine");
                    return Err(rocket);
                };
                let pool = (**db).clone();

                let config = ImportConfig::from_env();
                let rules = match load_rules(&config) {
                    Ok(rules) => rules,
                    Err(e) => {
                        log::error!("failed to load import rule sets: {}", e);
                        return Err(rocket);
                    }
                };
                log::info!(
                    "import engine ready: source kinds [{}], batch size {}, {} workers",
                    rules.kinds().join(", "),
                    config.batch_size,
                    config.workers
                );

                let repository = Arc::new(PgLeadRepository::new(
                    pool.clone(),
                    config.lookup_chunk_size,
                ));
                let importer = LeadImporter::new(repository, Arc::new(rules), config.clone());
                let jobs = JobRegistry::with_retention(config.job_retention);

                Ok(rocket
                    .manage(pool)
                    .manage(config)
                    .manage(importer)
                    .manage(jobs))
            },
        ))
        .mount(
            "/api/v1",
            openapi_get_routes![
                // Health routes
                routes::health::health_check,
                routes::health::readiness_check,
                // Import routes
                routes::imports::get_import,
                routes::imports::cancel_import,
                routes::imports::list_source_kinds,
            ],
        )
        // Streams a raw body, so it stays out of the generated document
        .mount("/api/v1", routes![routes::imports::start_import])
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Lead Import API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};
    use rocket_db_pools::sqlx::{self, PgPool};

    pub use database::{TestDatabase, TestDatabaseError};

    /// Helpers for seeding CRM tables in tests.
    pub struct TestFixtures<'a> {
        pool: &'a PgPool,
    }

    impl<'a> TestFixtures<'a> {
        pub fn new(pool: &'a PgPool) -> Self {
            Self { pool }
        }

        /// Insert a campaign with one stage, returning `(campaign_id, stage_id)`.
        pub async fn insert_campaign(&self, name: &str) -> Result<(i32, i32), sqlx::Error> {
            let campaign_id: i32 =
                sqlx::query_scalar("INSERT INTO campaigns (name) VALUES ($1) RETURNING id")
                    .bind(name)
                    .fetch_one(self.pool)
                    .await?;

            let stage_id: i32 = sqlx::query_scalar(
                "INSERT INTO campaign_stages (campaign_id, name, position) VALUES ($1, $2, 0) RETURNING id",
            )
            .bind(campaign_id)
            .bind("Novo")
            .fetch_one(self.pool)
            .await?;

            Ok((campaign_id, stage_id))
        }

        pub async fn insert_member(&self, name: &str) -> Result<i32, sqlx::Error> {
            sqlx::query_scalar("INSERT INTO team_members (name) VALUES ($1) RETURNING id")
                .bind(name)
                .fetch_one(self.pool)
                .await
        }

        /// Insert a lead directly, bypassing the import engine.
        pub async fn insert_lead(
            &self,
            name: &str,
            phone: &str,
            company: Option<&str>,
            notes: Option<&str>,
        ) -> Result<i32, sqlx::Error> {
            sqlx::query_scalar(
                "INSERT INTO leads (name, phone, company, notes) VALUES ($1, $2, $3, $4) RETURNING id",
            )
            .bind(name)
            .bind(phone)
            .bind(company)
            .bind(notes)
            .fetch_one(self.pool)
            .await
        }

        pub async fn count(&self, table: &str) -> Result<i64, sqlx::Error> {
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(self.pool)
                .await
        }
    }

    pub mod database {
        use crate::database::MIGRATOR;
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use testcontainers::{GenericImage, ImageExt, core::WaitFor};
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral database backed by a disposable Postgres container.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<GenericImage>>,
        }

        impl TestDatabase {
            /// Launch a container, create a fresh database and migrate it.
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let container = GenericImage::new("postgres", "16-alpine")
                    .with_wait_for(WaitFor::message_on_stdout(
                        "database system is ready to accept connections",
                    ))
                    .with_wait_for(WaitFor::message_on_stderr(
                        "database system is ready to accept connections",
                    ))
                    .with_env_var("POSTGRES_DB", "postgres")
                    .with_env_var("POSTGRES_USER", "postgres")
                    .with_env_var("POSTGRES_PASSWORD", "postgres")
                    .start()
                    .await?;

                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let admin_url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                let base_options: PgConnectOptions = admin_url.parse()?;
                let base_options = base_options.log_statements(LevelFilter::Off);
                let admin_options = base_options.clone().database("postgres");

                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await?;

                let database_name = format!("leads_{}", Uuid::new_v4().simple());
                sqlx::query(&format!(
                    "CREATE DATABASE \"{}\" TEMPLATE template0",
                    database_name
                ))
                .execute(&admin_pool)
                .await?;
                admin_pool.close().await;

                let pool = PgPoolOptions::new()
                    .max_connections(8)
                    .connect_with(base_options.database(&database_name))
                    .await?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name,
                    container: Some(container),
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database(self.admin_options.clone(), &self.database_name).await?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;

            sqlx::query(&format!("DROP DATABASE \"{}\" WITH (FORCE)", database_name))
                .execute(&admin_pool)
                .await?;
            Ok(())
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ = drop_database(admin_options, &db_name).await;
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }

    pub mod memory {
        //! In-memory [`LeadRepository`] for engine tests.

        use crate::import::data_structures::{
            ExistingLead, GroupingLink, LeadUpdate, NewLead, ParsedLeadRecord,
        };
        use crate::import::repository::{LeadRepository, RepositoryError};
        use parking_lot::Mutex;
        use std::collections::{BTreeMap, BTreeSet, HashSet};

        /// A lead as stored by [`MemoryLeadRepository`].
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct StoredLead {
            pub id: i32,
            pub phone: Option<String>,
            pub record: ParsedLeadRecord,
        }

        #[derive(Default)]
        struct MemoryState {
            next_id: i32,
            leads: BTreeMap<i32, StoredLead>,
            tags: BTreeMap<String, (i32, String)>,
            tag_links: BTreeSet<(i32, i32)>,
            campaign_links: BTreeMap<(i32, i32), GroupingLink>,
            failing_names: HashSet<String>,
            phone_lookups: usize,
        }

        impl MemoryState {
            fn next_id(&mut self) -> i32 {
                self.next_id += 1;
                self.next_id
            }
        }

        #[derive(Default)]
        pub struct MemoryLeadRepository {
            state: Mutex<MemoryState>,
        }

        impl MemoryLeadRepository {
            pub fn new() -> Self {
                Self::default()
            }

            /// Store a pre-existing lead, returning its id.
            pub fn seed_lead(&self, lead: ExistingLead) -> i32 {
                let mut state = self.state.lock();
                let id = state.next_id();
                state.leads.insert(
                    id,
                    StoredLead {
                        id,
                        phone: Some(lead.phone),
                        record: ParsedLeadRecord {
                            name: lead.name,
                            company: lead.company,
                            email: lead.email,
                            revenue_band: lead.revenue_band,
                            segment: lead.segment,
                            notes: lead.notes,
                            ..Default::default()
                        },
                    },
                );
                id
            }

            /// Make `insert_lead` fail for leads with this name.
            pub fn fail_inserts_for(&self, name: &str) {
                self.state.lock().failing_names.insert(name.to_string());
            }

            pub fn lead(&self, id: i32) -> Option<StoredLead> {
                self.state.lock().leads.get(&id).cloned()
            }

            pub fn leads(&self) -> Vec<StoredLead> {
                self.state.lock().leads.values().cloned().collect()
            }

            pub fn lead_by_phone(&self, phone: &str) -> Option<StoredLead> {
                self.state
                    .lock()
                    .leads
                    .values()
                    .find(|lead| lead.phone.as_deref() == Some(phone))
                    .cloned()
            }

            pub fn lead_count(&self) -> usize {
                self.state.lock().leads.len()
            }

            pub fn tag_count(&self) -> usize {
                self.state.lock().tags.len()
            }

            pub fn tag_color(&self, name: &str) -> Option<String> {
                self.state.lock().tags.get(name).map(|(_, color)| color.clone())
            }

            pub fn tag_links_for(&self, lead_id: i32) -> Vec<i32> {
                self.state
                    .lock()
                    .tag_links
                    .iter()
                    .filter(|(lead, _)| *lead == lead_id)
                    .map(|(_, tag)| *tag)
                    .collect()
            }

            pub fn campaign_link_count(&self, campaign_id: i32) -> usize {
                self.state
                    .lock()
                    .campaign_links
                    .keys()
                    .filter(|(campaign, _)| *campaign == campaign_id)
                    .count()
            }

            /// `Some(assignee)` when the lead is in the campaign.
            pub fn assignee_of(&self, campaign_id: i32, lead_id: i32) -> Option<Option<i32>> {
                self.state
                    .lock()
                    .campaign_links
                    .get(&(campaign_id, lead_id))
                    .map(|link| link.assignee_id)
            }

            /// Number of `find_leads_by_phones` calls so far.
            pub fn phone_lookups(&self) -> usize {
                self.state.lock().phone_lookups
            }
        }

        fn fill(target: &mut Option<String>, value: &Option<String>) {
            if value.is_some() {
                target.clone_from(value);
            }
        }

        #[rocket::async_trait]
        impl LeadRepository for MemoryLeadRepository {
            async fn find_leads_by_phones(
                &self,
                phones: &[String],
            ) -> Result<Vec<ExistingLead>, RepositoryError> {
                let mut state = self.state.lock();
                state.phone_lookups += 1;
                let wanted: HashSet<&str> = phones.iter().map(String::as_str).collect();

                Ok(state
                    .leads
                    .values()
                    .filter_map(|lead| {
                        let phone = lead.phone.as_deref()?;
                        wanted.contains(phone).then(|| ExistingLead {
                            id: lead.id,
                            name: lead.record.name.clone(),
                            phone: phone.to_string(),
                            company: lead.record.company.clone(),
                            email: lead.record.email.clone(),
                            revenue_band: lead.record.revenue_band.clone(),
                            segment: lead.record.segment.clone(),
                            notes: lead.record.notes.clone(),
                        })
                    })
                    .collect())
            }

            async fn find_phoneless_leads_by_emails(
                &self,
                emails: &[String],
            ) -> Result<Vec<ExistingLead>, RepositoryError> {
                let state = self.state.lock();
                let wanted: HashSet<&str> = emails.iter().map(String::as_str).collect();

                Ok(state
                    .leads
                    .values()
                    .filter(|lead| lead.phone.as_deref().unwrap_or("").is_empty())
                    .filter_map(|lead| {
                        let email = lead.record.email.as_deref()?.trim().to_lowercase();
                        wanted.contains(email.as_str()).then(|| ExistingLead {
                            id: lead.id,
                            name: lead.record.name.clone(),
                            phone: String::new(),
                            company: lead.record.company.clone(),
                            email: lead.record.email.clone(),
                            revenue_band: lead.record.revenue_band.clone(),
                            segment: lead.record.segment.clone(),
                            notes: lead.record.notes.clone(),
                        })
                    })
                    .collect())
            }

            async fn insert_lead(&self, lead: &NewLead) -> Result<i32, RepositoryError> {
                let mut state = self.state.lock();
                if state.failing_names.contains(&lead.record.name) {
                    return Err(RepositoryError::Rejected(format!(
                        "insert refused for '{}'",
                        lead.record.name
                    )));
                }
                let id = state.next_id();
                state.leads.insert(
                    id,
                    StoredLead {
                        id,
                        phone: lead.phone.clone(),
                        record: lead.record.clone(),
                    },
                );
                Ok(id)
            }

            async fn update_lead(
                &self,
                lead_id: i32,
                update: &LeadUpdate,
            ) -> Result<(), RepositoryError> {
                let mut state = self.state.lock();
                let lead = state
                    .leads
                    .get_mut(&lead_id)
                    .ok_or_else(|| RepositoryError::Rejected(format!("lead {lead_id} not found")))?;
                fill(&mut lead.record.company, &update.company);
                fill(&mut lead.record.email, &update.email);
                fill(&mut lead.record.revenue_band, &update.revenue_band);
                fill(&mut lead.record.segment, &update.segment);
                fill(&mut lead.record.notes, &update.notes);
                Ok(())
            }

            async fn find_tag_by_name(&self, name: &str) -> Result<Option<i32>, RepositoryError> {
                Ok(self.state.lock().tags.get(name).map(|(id, _)| *id))
            }

            async fn insert_tag(&self, name: &str, color: &str) -> Result<i32, RepositoryError> {
                let mut state = self.state.lock();
                if state.tags.contains_key(name) {
                    return Err(RepositoryError::Rejected(format!("tag '{name}' exists")));
                }
                let id = state.next_id();
                state.tags.insert(name.to_string(), (id, color.to_string()));
                Ok(id)
            }

            async fn get_or_create_tag(
                &self,
                name: &str,
                color: &str,
            ) -> Result<i32, RepositoryError> {
                let mut state = self.state.lock();
                if let Some((id, _)) = state.tags.get(name) {
                    return Ok(*id);
                }
                let id = state.next_id();
                state.tags.insert(name.to_string(), (id, color.to_string()));
                Ok(id)
            }

            async fn find_grouping_link(
                &self,
                lead_id: i32,
                campaign_id: i32,
            ) -> Result<bool, RepositoryError> {
                Ok(self
                    .state
                    .lock()
                    .campaign_links
                    .contains_key(&(campaign_id, lead_id)))
            }

            async fn insert_grouping_link(&self, link: GroupingLink) -> Result<(), RepositoryError> {
                self.state
                    .lock()
                    .campaign_links
                    .entry((link.campaign_id, link.lead_id))
                    .or_insert(link);
                Ok(())
            }

            async fn find_tag_link(&self, lead_id: i32, tag_id: i32) -> Result<bool, RepositoryError> {
                Ok(self.state.lock().tag_links.contains(&(lead_id, tag_id)))
            }

            async fn insert_tag_link(&self, lead_id: i32, tag_id: i32) -> Result<(), RepositoryError> {
                self.state.lock().tag_links.insert((lead_id, tag_id));
                Ok(())
            }
        }
    }

    type StateHook = Box<dyn FnOnce(Rocket<Build>) -> Rocket<Build> + Send>;

    /// Builder for constructing Rocket instances tailored for integration tests.
    #[derive(Default)]
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        states: Vec<StateHook>,
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                mounts: Vec::new(),
                states: Vec::new(),
            }
        }

        /// Mount routes under `/api/v1`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/api/v1".to_string(), routes));
            self
        }

        /// Manage any state value, e.g. a `PgPool`, `LeadImporter` or `JobRegistry`.
        pub fn manage<T: Send + Sync + 'static>(mut self, state: T) -> Self {
            self.states
                .push(Box::new(move |rocket: Rocket<Build>| rocket.manage(state)));
            self
        }

        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment);

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }

            for hook in self.states {
                rocket = hook(rocket);
            }

            rocket
        }

        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}
