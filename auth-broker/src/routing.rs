// auth-broker/src/routing.rs
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;

use crate::actors::PairingSession;
use crate::dispatcher::BrokerCore;

/// Configure routes: widget and authenticator share one endpoint, the
/// command stream tells them apart.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(pairing_route)));
}

async fn pairing_route(
    req: HttpRequest,
    stream: web::Payload,
    core: web::Data<BrokerCore>,
) -> Result<HttpResponse, Error> {
    ws::start(PairingSession::new(core.clone().into_inner()), &req, stream)
}
