//! Custom Resource Definitions for the tenancy operator

mod binding;
mod business;
mod role_template;
mod types;
mod user;

pub use binding::{
    BindingSpec, BindingStatus, BusinessRef, BusinessRoleTemplateBinding, BUSINESS_NAME_SEPARATOR,
};
pub use business::{
    Business, BusinessSpec, BusinessStatus, CONDITION_BACKING_NAMESPACE_CREATED,
    CONDITION_CREATOR_MADE_OWNER,
};
pub use role_template::{RoleTemplate, RoleTemplateSpec};
pub use types::{Condition, ConditionStatus, ConditionsExt, PolicyRule};
pub use user::{User, UserSpec};
