use serde::{
    Deserialize,
    Serialize,
};

#[derive(Serialize, Deserialize, Copy, Clone, Debug)]
pub enum Region {
    #[serde(rename = "aws-us-east-1")]
    AwsUsEast1,
}
