use crate::error::AppError;
use crate::validation::ToValidationResponse;
use rocket::http::Status;

#[test]
fn statuses_map_to_field_scoped_errors() {
    let cases = [
        (Status::Forbidden, "permission"),
        (Status::Unauthorized, "authentication"),
        (Status::NotFound, "resource"),
        (Status::Conflict, "resource"),
        (Status::BadRequest, "request"),
        (Status::UnprocessableEntity, "validation"),
        (Status::InternalServerError, "server"),
        (Status::ServiceUnavailable, "service"),
        (Status::ImATeapot, "error"),
    ];

    for (status, field) in cases {
        let response = status.to_validation_response();
        assert_eq!(response.0, status);
        assert_eq!(response.1.status, "error");
        assert!(
            response.1.errors.contains_key(field),
            "status {} should report under '{}'",
            status,
            field
        );
    }
}

#[test]
fn app_errors_carry_their_status_and_field() {
    let response = AppError::Validation("Title is required".to_string()).to_validation_response();
    assert_eq!(response.0, Status::BadRequest);
    assert_eq!(
        response.1.errors["validation"],
        vec!["Title is required".to_string()]
    );

    let response = AppError::NotFound("Assignment 7 not found".to_string()).to_validation_response();
    assert_eq!(response.0, Status::NotFound);
    assert!(response.1.errors.contains_key("resource"));
}
