use crate::errors::IssuanceError;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::AUTHORIZATION,
    Error, HttpMessage,
};
use futures_util::future::LocalBoxFuture;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::Arc;

/// Operator token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

/// HS256 bearer auth for operator routes. Without a secret every request
/// passes through, which is how local memory-backed runs are started.
#[derive(Clone)]
pub struct JwtAuth {
    secret: Option<Arc<DecodingKey>>,
}

impl JwtAuth {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret: secret
                .filter(|s| !s.is_empty())
                .map(|s| Arc::new(DecodingKey::from_secret(s.as_bytes()))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }
}

fn bearer_token(req: &ServiceRequest) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

impl<S, B> Transform<S, ServiceRequest> for JwtAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = JwtAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(JwtAuthMiddleware {
            service: Rc::new(service),
            secret: self.secret.clone(),
        }))
    }
}

pub struct JwtAuthMiddleware<S> {
    service: Rc<S>,
    secret: Option<Arc<DecodingKey>>,
}

impl<S, B> Service<ServiceRequest> for JwtAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let key = match &self.secret {
            Some(key) => key,
            None => {
                let fut = self.service.call(req);
                return Box::pin(async move { fut.await });
            }
        };

        let token = match bearer_token(&req) {
            Some(token) => token,
            None => {
                tracing::warn!("Missing bearer token on {}", req.path());
                return Box::pin(async { Err(Error::from(IssuanceError::Unauthorized)) });
            }
        };

        match decode::<Claims>(token, key, &Validation::new(Algorithm::HS256)) {
            Ok(token_data) => {
                tracing::debug!(
                    "Operator {} ({}) authorized for {}",
                    token_data.claims.sub,
                    token_data.claims.role,
                    req.path()
                );
                req.extensions_mut().insert(token_data.claims);

                let fut = self.service.call(req);
                Box::pin(async move { fut.await })
            }
            Err(err) => {
                tracing::warn!("JWT validation failed on {}: {:?}", req.path(), err);
                Box::pin(async { Err(Error::from(IssuanceError::Unauthorized)) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, web, App, HttpResponse};
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, exp_offset: i64) -> String {
        let claims = Claims {
            sub: "ops@afristable".to_string(),
            role: "operator".to_string(),
            exp: (chrono::Utc::now().timestamp() + exp_offset) as usize,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    async fn protected() -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    #[actix_web::test]
    async fn test_disabled_auth_passes_through() {
        let auth = JwtAuth::new(None);
        assert!(!auth.is_enabled());

        let app = test::init_service(
            App::new().service(web::scope("/admin").wrap(auth).route("/x", web::post().to(protected))),
        )
        .await;
        let resp = test::call_service(&app, test::TestRequest::post().uri("/admin/x").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_bearer_token_is_required_when_enabled() {
        let app = test::init_service(
            App::new().service(
                web::scope("/admin")
                    .wrap(JwtAuth::new(Some("jwt-secret")))
                    .route("/x", web::post().to(protected)),
            ),
        )
        .await;

        let missing = test::TestRequest::post().uri("/admin/x").to_request();
        let err = test::try_call_service(&app, missing).await.unwrap_err();
        assert_eq!(err.as_response_error().status_code(), StatusCode::UNAUTHORIZED);

        for bad in [token("other", 3600), token("jwt-secret", -3600)] {
            let req = test::TestRequest::post()
                .uri("/admin/x")
                .insert_header((AUTHORIZATION, format!("Bearer {}", bad)))
                .to_request();
            let err = test::try_call_service(&app, req).await.unwrap_err();
            assert_eq!(err.as_response_error().status_code(), StatusCode::UNAUTHORIZED);
        }

        let valid = test::TestRequest::post()
            .uri("/admin/x")
            .insert_header((AUTHORIZATION, format!("Bearer {}", token("jwt-secret", 3600))))
            .to_request();
        let resp = test::call_service(&app, valid).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
