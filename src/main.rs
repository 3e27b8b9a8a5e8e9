#[rocket::launch]
fn rocket() -> _ {
    lead_import::init_logger();
    log::info!("starting lead import API server");
    lead_import::rocket()
}
