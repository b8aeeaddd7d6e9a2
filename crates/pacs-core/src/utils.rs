//! 通用工具函数

use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{PacsError, Result};

/// 生成唯一的DICOM标识符
pub fn generate_dicom_uid() -> String {
    // UUID派生UID根 (PS3.5 B.2)，总长度不超过64字符
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= 64
        && uid.split('.').all(|part| {
            !part.is_empty()
                && part.chars().all(|c| c.is_ascii_digit())
                && (part == "0" || !part.starts_with('0'))
        })
}

/// 生成关联ID: `ASSOC-<epoch毫秒>-<随机串>`
pub fn mint_association_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("ASSOC-{}-{}", Utc::now().timestamp_millis(), &random[..9])
}

/// 日期区间，左闭右开 `[start, end_exclusive)`，两端均可缺省
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end_exclusive: Option<NaiveDate>,
}

impl DateRange {
    /// 单日区间 `[day, day+1)`
    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: Some(day),
            end_exclusive: day.checked_add_days(Days::new(1)),
        }
    }

    /// 闭区间 `[start, end]`
    pub fn inclusive(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self {
            start,
            end_exclusive: end.and_then(|e| e.checked_add_days(Days::new(1))),
        }
    }

    /// 解析DICOM DA查询值：`YYYYMMDD`、`YYYYMMDD-YYYYMMDD`、`YYYYMMDD-`、`-YYYYMMDD`
    pub fn parse_dicom(value: &str) -> Result<Self> {
        let value = value.trim();
        match value.split_once('-') {
            None => Ok(Self::single_day(parse_dicom_date(value)?)),
            Some((start, end)) => {
                let start = if start.is_empty() { None } else { Some(parse_dicom_date(start)?) };
                let end = if end.is_empty() { None } else { Some(parse_dicom_date(end)?) };
                if start.is_none() && end.is_none() {
                    return Err(PacsError::Validation(format!("无效的日期区间: {:?}", value)));
                }
                if let (Some(s), Some(e)) = (start, end) {
                    if s > e {
                        return Err(PacsError::Validation(format!("日期区间起点晚于终点: {}", value)));
                    }
                }
                Ok(Self::inclusive(start, end))
            }
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end_exclusive.map_or(true, |e| date < e)
    }

    /// 转回DICOM DA区间表示（终点为闭区间）
    pub fn to_dicom(&self) -> String {
        let start = self.start.map(format_dicom_date).unwrap_or_default();
        let end = self
            .end_exclusive
            .and_then(|e| e.checked_sub_days(Days::new(1)))
            .map(format_dicom_date)
            .unwrap_or_default();
        if start == end {
            start
        } else {
            format!("{}-{}", start, end)
        }
    }
}

/// 解析 `YYYYMMDD`
pub fn parse_dicom_date(value: &str) -> Result<NaiveDate> {
    let value = value.trim();
    if value.len() != 8 || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(PacsError::Validation(format!("无效的DICOM日期: {:?}", value)));
    }
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .map_err(|e| PacsError::Validation(format!("无效的DICOM日期 {:?}: {}", value, e)))
}

pub fn format_dicom_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}
