//! Launch templates: the recipe every new instance is built from

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::instance::Instance;
use crate::network::{Resource, SharedSecurityGroup};

/// Immutable instance-creation recipe
#[derive(Debug, Clone)]
pub struct LaunchTemplate {
    id: String,
    instance_type: String,
    image_id: String,
    security_groups: Vec<SharedSecurityGroup>,
}

impl LaunchTemplate {
    pub fn new(
        id: impl Into<String>,
        instance_type: impl Into<String>,
        image_id: impl Into<String>,
        security_groups: Vec<SharedSecurityGroup>,
    ) -> Self {
        Self {
            id: id.into(),
            instance_type: instance_type.into(),
            image_id: image_id.into(),
            security_groups,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn instance_type(&self) -> &str {
        &self.instance_type
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn security_groups(&self) -> &[SharedSecurityGroup] {
        &self.security_groups
    }

    /// Build a stopped instance with the template's groups attached
    pub fn create_instance(&self, id: impl Into<String>) -> Instance {
        let mut instance = Instance::new(id, &self.instance_type, &self.image_id);
        for group in &self.security_groups {
            instance.attach_security_group(group.clone());
        }
        instance
    }

    /// Resolve a serialized template. Returns the first unknown security group id.
    pub fn from_spec(
        spec: &TemplateSpec,
        lookup: &HashMap<String, SharedSecurityGroup>,
    ) -> Result<Self, String> {
        let security_groups = spec
            .security_groups
            .iter()
            .map(|id| lookup.get(id).cloned().ok_or_else(|| id.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(
            &spec.id,
            &spec.instance_type,
            &spec.image_id,
            security_groups,
        ))
    }

    pub fn to_spec(&self) -> TemplateSpec {
        TemplateSpec {
            id: self.id.clone(),
            instance_type: self.instance_type.clone(),
            image_id: self.image_id.clone(),
            security_groups: self
                .security_groups
                .iter()
                .map(|g| g.id().to_string())
                .collect(),
        }
    }
}

/// Serializable template, referencing security groups by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub id: String,
    pub instance_type: String,
    pub image_id: String,
    #[serde(default)]
    pub security_groups: Vec<String>,
}
