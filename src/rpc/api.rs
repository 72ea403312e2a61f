//! EC2-shaped wire types exchanged over the bus. Field names follow the
//! AWS JSON casing.

use crate::instance::VmStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ec2State {
    #[serde(rename = "Code")]
    pub code: i64,
    #[serde(rename = "Name")]
    pub name: String,
}

impl From<VmStatus> for Ec2State {
    fn from(status: VmStatus) -> Self {
        let (code, name) = status.ec2_state();
        Self {
            code,
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateReason {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EbsAttachment {
    #[serde(rename = "VolumeId")]
    pub volume_id: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "DeleteOnTermination")]
    pub delete_on_termination: bool,
    #[serde(rename = "AttachTime", skip_serializing_if = "Option::is_none")]
    pub attach_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockDeviceMapping {
    #[serde(rename = "DeviceName")]
    pub device_name: String,
    #[serde(rename = "Ebs")]
    pub ebs: EbsAttachment,
}

/// The guest-visible instance object embedded in the VM record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ec2Instance {
    #[serde(rename = "InstanceId")]
    pub instance_id: String,
    #[serde(rename = "ImageId")]
    pub image_id: String,
    #[serde(rename = "InstanceType")]
    pub instance_type: String,
    #[serde(rename = "KeyName", skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(rename = "LaunchTime")]
    pub launch_time: String,
    #[serde(rename = "State")]
    pub state: Ec2State,
    #[serde(rename = "StateReason", skip_serializing_if = "Option::is_none")]
    pub state_reason: Option<StateReason>,
    #[serde(rename = "BlockDeviceMappings", default)]
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

impl Ec2Instance {
    pub fn new(
        instance_id: impl Into<String>,
        image_id: impl Into<String>,
        instance_type: impl Into<String>,
        key_name: Option<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            image_id: image_id.into(),
            instance_type: instance_type.into(),
            key_name,
            launch_time: chrono::Utc::now().to_rfc3339(),
            state: Ec2State::from(VmStatus::Provisioning),
            state_reason: None,
            block_device_mappings: Vec::new(),
        }
    }

    pub fn set_state(&mut self, status: VmStatus) {
        self.state = Ec2State::from(status);
    }

    pub fn upsert_block_device(&mut self, mapping: BlockDeviceMapping) {
        if let Some(existing) = self
            .block_device_mappings
            .iter_mut()
            .find(|m| m.ebs.volume_id == mapping.ebs.volume_id)
        {
            *existing = mapping;
        } else {
            self.block_device_mappings.push(mapping);
        }
    }

    pub fn remove_block_device(&mut self, volume_id: &str) {
        self.block_device_mappings
            .retain(|m| m.ebs.volume_id != volume_id);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    #[serde(rename = "ReservationId")]
    pub reservation_id: String,
    #[serde(rename = "OwnerId")]
    pub owner_id: String,
    #[serde(rename = "Instances")]
    pub instances: Vec<Ec2Instance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EbsBlockDeviceRequest {
    #[serde(rename = "VolumeId", skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,
    #[serde(rename = "VolumeSize", skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<u64>,
    #[serde(rename = "DeleteOnTermination", default)]
    pub delete_on_termination: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDeviceMappingRequest {
    #[serde(rename = "DeviceName")]
    pub device_name: String,
    #[serde(rename = "Ebs", skip_serializing_if = "Option::is_none")]
    pub ebs: Option<EbsBlockDeviceRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInstancesInput {
    #[serde(rename = "ImageId")]
    pub image_id: String,
    #[serde(rename = "InstanceType")]
    pub instance_type: String,
    #[serde(rename = "MinCount")]
    pub min_count: u64,
    #[serde(rename = "MaxCount")]
    pub max_count: u64,
    #[serde(rename = "KeyName", skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(rename = "UserData", skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(rename = "BlockDeviceMappings", default)]
    pub block_device_mappings: Vec<BlockDeviceMappingRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DescribeInstancesInput {
    #[serde(rename = "InstanceIds", default)]
    pub instance_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescribeInstancesOutput {
    #[serde(rename = "Reservations")]
    pub reservations: Vec<Reservation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DescribeInstanceTypesInput {
    #[serde(rename = "ShowCapacity", default)]
    pub show_capacity: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceTypeInfo {
    #[serde(rename = "InstanceType")]
    pub instance_type: String,
    #[serde(rename = "DefaultVCpus")]
    pub default_vcpus: u32,
    #[serde(rename = "MemoryMiB")]
    pub memory_mib: u64,
    #[serde(rename = "Architecture")]
    pub architecture: String,
    #[serde(rename = "CurrentGeneration")]
    pub current_generation: bool,
    #[serde(rename = "BurstablePerformanceSupported")]
    pub burstable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescribeInstanceTypesOutput {
    #[serde(rename = "InstanceTypes")]
    pub instance_types: Vec<InstanceTypeInfo>,
}

/// Targeted command envelope for `ec2.cmd.<instanceID>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InstanceCommand {
    AttachVolume {
        volume_id: String,
        #[serde(default)]
        device: Option<String>,
    },
    DetachVolume {
        volume_id: String,
        #[serde(default)]
        force: bool,
    },
    Start,
    Stop,
    Terminate,
    Qmp {
        execute: String,
        #[serde(default)]
        arguments: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachVolumeOutput {
    #[serde(rename = "VolumeId")]
    pub volume_id: String,
    #[serde(rename = "InstanceId")]
    pub instance_id: String,
    #[serde(rename = "Device")]
    pub device: String,
    #[serde(rename = "State")]
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStateChange {
    #[serde(rename = "InstanceId")]
    pub instance_id: String,
    #[serde(rename = "CurrentState")]
    pub current_state: Ec2State,
    #[serde(rename = "PreviousState")]
    pub previous_state: Ec2State,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceIdRequest {
    pub instance_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeValue {
    #[serde(rename = "Value")]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyInstanceAttributeInput {
    #[serde(rename = "InstanceId")]
    pub instance_id: String,
    #[serde(rename = "InstanceType", skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<AttributeValue>,
    #[serde(rename = "UserData", skip_serializing_if = "Option::is_none")]
    pub user_data: Option<AttributeValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateImageInput {
    #[serde(rename = "InstanceId")]
    pub instance_id: String,
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateImageOutput {
    #[serde(rename = "ImageId")]
    pub image_id: String,
    #[serde(rename = "SourceVolumeId")]
    pub source_volume_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_instances_input_wire_names() {
        let json = r#"{
            "ImageId": "ami-abc",
            "InstanceType": "t3.micro",
            "MinCount": 1,
            "MaxCount": 2,
            "KeyName": "ops"
        }"#;
        let input: RunInstancesInput = serde_json::from_str(json).unwrap();
        assert_eq!(input.image_id, "ami-abc");
        assert_eq!(input.min_count, 1);
        assert_eq!(input.max_count, 2);
        assert!(input.block_device_mappings.is_empty());
    }

    #[test]
    fn test_instance_command_envelope() {
        let json = r#"{"op":"attach_volume","volume_id":"vol-1","device":"/dev/sdf"}"#;
        let cmd: InstanceCommand = serde_json::from_str(json).unwrap();
        assert!(matches!(
            cmd,
            InstanceCommand::AttachVolume { ref volume_id, .. } if volume_id == "vol-1"
        ));

        let json = r#"{"op":"qmp","execute":"query-status"}"#;
        let cmd: InstanceCommand = serde_json::from_str(json).unwrap();
        assert!(matches!(cmd, InstanceCommand::Qmp { .. }));
    }

    #[test]
    fn test_state_mirrors_status() {
        let mut ec2 = Ec2Instance::new("i-1", "ami-1", "t3.micro", None);
        assert_eq!(ec2.state.code, 0);
        ec2.set_state(VmStatus::Running);
        assert_eq!(ec2.state.code, 16);
        assert_eq!(ec2.state.name, "running");
    }

    #[test]
    fn test_block_device_upsert_and_remove() {
        let mut ec2 = Ec2Instance::new("i-1", "ami-1", "t3.micro", None);
        ec2.upsert_block_device(BlockDeviceMapping {
            device_name: "/dev/sdf".to_string(),
            ebs: EbsAttachment {
                volume_id: "vol-1".to_string(),
                status: "attached".to_string(),
                delete_on_termination: false,
                attach_time: None,
            },
        });
        assert_eq!(ec2.block_device_mappings.len(), 1);

        ec2.remove_block_device("vol-1");
        assert!(ec2.block_device_mappings.is_empty());
    }
}
