pub mod credentials;
pub mod deployments;
pub mod health_checks;
pub mod models;
pub mod webhook;

pub use health_checks::*;

use crate::services::integration::ApiResponse;
use actix_web::body::BoxBody;
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, Responder};
use serde::Serialize;

impl<T: Serialize> Responder for ApiResponse<T> {
    type Body = BoxBody;

    fn respond_to(self, _req: &HttpRequest) -> HttpResponse<Self::Body> {
        let status = match &self.error {
            Some(error) => StatusCode::from_u16(error.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            None => StatusCode::OK,
        };
        HttpResponse::build(status).json(self)
    }
}
